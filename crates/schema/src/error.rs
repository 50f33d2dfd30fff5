//! Error types for the schema crate.

use thiserror::Error;

/// Record validation failure.
///
/// Validation runs before any I/O, so these errors never leave partial state
/// behind and are never worth retrying unchanged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field was empty or only whitespace.
    #[error("{field} must not be empty")]
    EmptyField {
        /// Name of the offending field.
        field: &'static str,
    },

    /// A field exceeded its maximum length.
    #[error("{field} exceeds {max} characters")]
    TooLong {
        /// Name of the offending field.
        field: &'static str,
        /// Maximum allowed length in characters.
        max: usize,
    },

    /// The email address is not of the form `local@domain`.
    #[error("invalid email address: {0}")]
    InvalidEmail(String),

    /// A layout position is NaN or infinite.
    #[error("invalid position for team {team}: coordinates must be finite")]
    InvalidPosition {
        /// The team whose position was rejected.
        team: String,
    },

    /// A key appears more than once where keys must be unique.
    #[error("duplicate {kind}: {key}")]
    Duplicate {
        /// What kind of key was duplicated (e.g. "team").
        kind: &'static str,
        /// The duplicated key.
        key: String,
    },
}

/// Result type alias for validation.
pub type Result<T> = std::result::Result<T, ValidationError>;
