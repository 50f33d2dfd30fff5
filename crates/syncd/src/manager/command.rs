//! Mutation commands and their outcomes.

use std::io;
use std::path::PathBuf;

use schema::{CachePatch, Collection, ValidationError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::DataCacheManager;
use crate::files::{CsvError, LockError, WriteError};
use crate::ratelimit::OperationClass;

/// Why a mutation was refused or failed.
#[derive(Debug, Error)]
pub enum MutationError {
    /// Malformed input, rejected before any I/O.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Update or removal of an entity that does not exist.
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// The operation class is out of tokens.
    #[error("too many {class} requests, try again shortly")]
    RateLimited {
        class: OperationClass,
        retry_after_ms: Option<u64>,
    },

    /// Another writer held the file lock for the whole acquire timeout.
    #[error("data file is busy: {0}")]
    LockContention(#[source] LockError),

    /// Writing the file failed after the lock was taken.
    #[error("failed to save changes: {0}")]
    Persistence(#[source] WriteError),

    /// The operation is not allowed in this build mode.
    #[error("{operation} is only available in development mode")]
    EnvironmentGuard { operation: &'static str },

    /// The import file could not be read.
    #[error("failed to read import file {path}: {source}")]
    ImportRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The import file is not usable CSV.
    #[error("invalid import file: {0}")]
    InvalidImport(#[from] CsvError),
}

impl MutationError {
    /// Suggested wait before retrying, for rate limited calls.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            MutationError::RateLimited { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }

    /// Whether the call was refused by the rate limiter.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, MutationError::RateLimited { .. })
    }

    pub(crate) fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        MutationError::NotFound {
            kind,
            key: key.into(),
        }
    }
}

impl From<WriteError> for MutationError {
    fn from(err: WriteError) -> Self {
        match err {
            WriteError::Lock(lock @ LockError::Timeout { .. }) => {
                MutationError::LockContention(lock)
            }
            other => MutationError::Persistence(other),
        }
    }
}

/// Serializable outcome handed to callers outside the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    /// Whether the operation took effect.
    pub success: bool,
    /// Human-readable failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Present only for rate limited calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl OperationResult {
    /// A successful outcome.
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            retry_after_ms: None,
        }
    }
}

impl<T> From<&Result<T, MutationError>> for OperationResult {
    fn from(result: &Result<T, MutationError>) -> Self {
        match result {
            Ok(_) => Self::ok(),
            Err(e) => Self {
                success: false,
                error: Some(e.to_string()),
                retry_after_ms: e.retry_after_ms(),
            },
        }
    }
}

/// One optimistic change to one collection.
///
/// `before` and `after` are full values of the collection, so applying or
/// rolling back is a single cache patch. `generation` is the cache's reload
/// generation when the command was built; a rollback is skipped if a reload
/// has replaced the cache since, because the reload's on-disk truth is newer
/// than `before`.
#[derive(Debug, Clone)]
pub struct MutationCommand {
    /// Operation name, for logs.
    pub name: &'static str,
    /// The collection being changed.
    pub collection: Collection,
    /// Value before the change.
    pub before: CachePatch,
    /// Value after the change.
    pub after: CachePatch,
    generation: u64,
}

impl MutationCommand {
    /// Build a command against the cache's current generation.
    pub fn new(
        name: &'static str,
        before: CachePatch,
        after: CachePatch,
        cache: &DataCacheManager,
    ) -> Self {
        Self {
            name,
            collection: after.collection(),
            before,
            after,
            generation: cache.generation(),
        }
    }

    /// Show the new value immediately.
    pub fn apply(&self, cache: &DataCacheManager) {
        debug!(op = self.name, collection = %self.collection, "Applying optimistic update");
        cache.update_cache(self.after.clone());
    }

    /// Replace the optimistic value with what was actually written.
    pub fn commit(&self, cache: &DataCacheManager, written: CachePatch) {
        if written != self.after {
            debug!(
                op = self.name,
                collection = %self.collection,
                "On-disk value differed from optimistic value"
            );
        }
        cache.update_cache(written);
    }

    /// Restore the previous value. Returns whether the cache was touched.
    pub fn rollback(&self, cache: &DataCacheManager) -> bool {
        if cache.generation() != self.generation {
            warn!(
                op = self.name,
                collection = %self.collection,
                "Skipping rollback, cache was reloaded since the update"
            );
            return false;
        }
        cache.update_cache(self.before.clone());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::{Contact, DataSnapshot};

    fn contacts(names: &[&str]) -> CachePatch {
        CachePatch::Contacts(
            names
                .iter()
                .map(|n| Contact::new(*n, format!("{n}@example.com")))
                .collect(),
        )
    }

    #[test]
    fn test_apply_then_rollback_restores_before() {
        let cache = DataCacheManager::new();
        cache.update_cache(contacts(&["alice"]));
        let before = cache.get_cache().contacts.clone();

        let command = MutationCommand::new(
            "add_contact",
            contacts(&["alice"]),
            contacts(&["alice", "bob"]),
            &cache,
        );
        command.apply(&cache);
        assert_eq!(cache.get_cache().contacts.len(), 2);

        assert!(command.rollback(&cache));
        assert_eq!(cache.get_cache().contacts, before);
    }

    #[test]
    fn test_rollback_is_skipped_after_reload() {
        let cache = DataCacheManager::new();
        let command = MutationCommand::new(
            "add_contact",
            contacts(&[]),
            contacts(&["bob"]),
            &cache,
        );
        command.apply(&cache);

        let reloaded = DataSnapshot {
            contacts: vec![Contact::new("carol", "carol@example.com")],
            ..Default::default()
        };
        cache.replace(reloaded.clone());

        assert!(!command.rollback(&cache));
        assert_eq!(cache.get_cache().contacts, reloaded.contacts);
    }

    #[test]
    fn test_lock_timeout_maps_to_contention() {
        let err = MutationError::from(WriteError::Lock(LockError::Timeout {
            path: PathBuf::from("contacts.json"),
            waited_ms: 5,
            holder: None,
        }));
        assert!(matches!(err, MutationError::LockContention(_)));
    }

    #[test]
    fn test_operation_result_for_rate_limit() {
        let result: Result<(), MutationError> = Err(MutationError::RateLimited {
            class: OperationClass::Import,
            retry_after_ms: Some(10_000),
        });
        let outcome = OperationResult::from(&result);
        assert!(!outcome.success);
        assert_eq!(outcome.retry_after_ms, Some(10_000));

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["retryAfterMs"], 10_000);
        assert_eq!(
            serde_json::to_value(OperationResult::ok()).unwrap(),
            serde_json::json!({ "success": true })
        );
    }
}
