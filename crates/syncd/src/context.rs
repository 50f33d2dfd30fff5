//! Shared services handed to the file manager at construction.

use std::path::Path;
use std::sync::Arc;

use crate::config::{BuildMode, Config};
use crate::files::LockManager;
use crate::ratelimit::RateLimiters;

/// Process-wide state built once at startup.
///
/// Two file managers built from the same context share rate limit budgets
/// and the in-process lock queue.
#[derive(Debug, Clone)]
pub struct SyncContext {
    /// Effective configuration.
    pub config: Arc<Config>,
    /// One token bucket per operation class.
    pub limiters: Arc<RateLimiters>,
    /// Lock manager for every file under the data root.
    pub locks: Arc<LockManager>,
    /// Whether development-only operations are allowed. Never above what
    /// the build allows.
    pub mode: BuildMode,
}

impl SyncContext {
    /// Build the context from configuration.
    pub fn new(config: Config) -> Self {
        let limiters = Arc::new(RateLimiters::from_config(&config.rate_limits));
        let locks = Arc::new(LockManager::new(&config.locks));
        let mode = config.runtime.mode.clamp_to_build();
        tracing::debug!(owner = locks.owner(), mode = ?mode, "Sync context created");
        Self {
            config: Arc::new(config),
            limiters,
            locks,
            mode,
        }
    }

    /// Replace the lock manager, e.g. to give it a recognizable owner id.
    pub fn with_locks(mut self, locks: LockManager) -> Self {
        self.locks = Arc::new(locks);
        self
    }

    /// The data root.
    pub fn data_dir(&self) -> &Path {
        &self.config.storage.data_dir
    }
}
