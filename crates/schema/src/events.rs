//! Reload lifecycle events broadcast by the data cache.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::snapshot::DataSnapshot;

/// Category of a data error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataErrorKind {
    /// A file could not be parsed.
    Parse,
    /// A file could not be read.
    Io,
    /// A file parsed but held invalid records.
    Validation,
    /// A write failed and was rolled back.
    Persistence,
    /// The file watcher failed.
    Watcher,
}

impl fmt::Display for DataErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataErrorKind::Parse => "parse",
            DataErrorKind::Io => "io",
            DataErrorKind::Validation => "validation",
            DataErrorKind::Persistence => "persistence",
            DataErrorKind::Watcher => "watcher",
        };
        f.write_str(s)
    }
}

/// Error payload with enough detail to guide remediation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataError {
    /// Error category.
    #[serde(rename = "type")]
    pub kind: DataErrorKind,
    /// Human-readable summary.
    pub message: String,
    /// The offending file, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Underlying cause, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl DataError {
    /// Create an error without a file or details.
    pub fn new(kind: DataErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            file: None,
            details: None,
        }
    }

    /// Attach the offending file.
    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Attach the underlying cause.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)?;
        if let Some(file) = &self.file {
            write!(f, " ({file})")?;
        }
        Ok(())
    }
}

/// Notification sent to cache subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum DataEvent {
    /// A full reload began.
    ReloadStarted,
    /// A full reload finished.
    ReloadCompleted {
        /// Whether every file loaded cleanly.
        success: bool,
    },
    /// The snapshot changed.
    DataUpdated(Arc<DataSnapshot>),
    /// Something went wrong loading or persisting data.
    DataError(DataError),
}
