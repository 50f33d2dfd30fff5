//! # Relay Sync Library
//!
//! This crate keeps an in-memory cache of the Relay data collections
//! consistent with the JSON files that hold them, while several processes
//! edit those files at once.
//!
//! ## Overview
//!
//! Every data file may be read and written by more than one Relay instance,
//! for example when the data root lives on a shared drive. The engine
//! provides:
//!
//! - **Path Safety**: Every file access is confined to the data root
//! - **Cooperative Locking**: Sidecar `.lock` files with leases and stale
//!   lock reclamation
//! - **Atomic Writes**: Temp-file, flush and rename, so readers never see a
//!   half-written file
//! - **Optimistic Mutations**: The cache updates at once and rolls back if
//!   the write fails
//! - **Change Detection**: External edits trigger a reload; our own writes
//!   do not
//! - **Rate Limiting**: Token buckets per operation class
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          FileManager                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │  Rate Limit  │  │ Data Cache   │  │    Echo Ledger       │   │
//! │  │   Buckets    │  │ + Events     │  │  (own write digests) │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘   │
//! │                                                                 │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │       AtomicWriter  ─►  LockManager  ─►  PathValidator     │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │                                                                 │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │            FileWatcher (debounced, per collection)         │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use schema::Contact;
//! use syncd::{Config, FileManager, SyncContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!     config.validate()?;
//!
//!     let manager = Arc::new(FileManager::new(SyncContext::new(config)));
//!     manager.start().await?;
//!
//!     manager
//!         .add_contact(Contact::new("Alice Smith", "alice@example.com"))
//!         .await?;
//!     println!("{} contacts", manager.get_cached_data().contacts.len());
//!
//!     manager.destroy();
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`context`]: Shared services handed to the file manager
//! - [`ratelimit`]: Token buckets per operation class
//! - [`files`]: Path validation, locking, atomic writes and CSV
//! - [`cache`]: Snapshot cache and lifecycle events
//! - [`watcher`]: Debounced change detection on the data root
//! - [`manager`]: The mutation API

pub mod cache;
pub mod config;
pub mod context;
pub mod files;
pub mod manager;
pub mod ratelimit;
pub mod watcher;

// Re-export schema for convenience
pub use schema;

// Re-export config types for convenience
pub use config::{BuildMode, Config, ConfigError, EnvOverride};

pub use context::SyncContext;

// Re-export rate limiting types for convenience
pub use ratelimit::{OperationClass, RateLimitDecision, RateLimiter, RateLimiters};

// Re-export files types for convenience
pub use files::{
    AtomicWriter, LockError, LockGuard, LockManager, PathError, PathValidator, WriteError,
    WriteReceipt,
};

pub use cache::{DataCacheManager, Subscription};

pub use watcher::{FileChange, FileWatcher, WatchError};

// Re-export manager types for convenience
pub use manager::{
    FileManager, ImportSummary, ManagerState, MutationCommand, MutationError, OperationResult,
};
