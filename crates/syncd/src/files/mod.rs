//! Filesystem safety layer.
//!
//! This module provides the primitives every write goes through:
//! - Path validation against the data root
//! - Cooperative cross-process locking with stale-lock reclamation
//! - Atomic temp-file-and-rename writes
//! - CSV import and export
//!
//! # Security
//!
//! All paths are resolved relative to the data root. Absolute, UNC and
//! traversing paths are rejected, and symlinks are resolved before the
//! containment check so an in-root link cannot point writes elsewhere.

pub mod atomic;
pub mod csv_io;
pub mod lock;
pub mod path_validator;

pub use atomic::{digest, ensure_bom, strip_bom, AtomicWriter, WriteError, WriteReceipt, BOM};
pub use csv_io::{CsvError, CsvImport, SkippedRow};
pub use lock::{lock_path_for, LockError, LockGuard, LockInfo, LockManager, LockRecord};
pub use path_validator::{validate_path, PathError, PathValidator};
