//! Crash-safe file replacement.
//!
//! Content is written to a uniquely named temp file next to the target,
//! flushed to disk, and renamed over the target. Readers therefore see
//! either the old file or the new one, never a mix. Writers that go through
//! [`AtomicWriter`] also hold the target's lock, so concurrent
//! read-modify-write cycles from different processes do not lose updates.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use super::lock::{LockError, LockManager};
use super::path_validator::{PathError, PathValidator};

/// UTF-8 byte-order marker.
pub const BOM: &[u8] = b"\xEF\xBB\xBF";

/// Errors that can occur during an atomic write.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The target path was rejected.
    #[error(transparent)]
    Path(#[from] PathError),

    /// The target's lock could not be taken.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Writing, flushing or renaming failed.
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The new value could not be serialized.
    #[error("failed to serialize {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Proof of a completed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Absolute path that was replaced.
    pub path: PathBuf,
    /// Number of bytes written.
    pub bytes: u64,
    /// Hex SHA-256 of the bytes written.
    pub digest: String,
}

/// Hex SHA-256 of `bytes`.
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Prefix `bytes` with a byte-order marker unless it already has one.
pub fn ensure_bom(bytes: &[u8]) -> Vec<u8> {
    if bytes.starts_with(BOM) {
        return bytes.to_vec();
    }
    let mut out = Vec::with_capacity(BOM.len() + bytes.len());
    out.extend_from_slice(BOM);
    out.extend_from_slice(bytes);
    out
}

/// `bytes` without a leading byte-order marker.
pub fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(BOM).unwrap_or(bytes)
}

fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.{:08x}.tmp", name, rand::random::<u32>()))
}

/// Lock-aware atomic writer rooted at the data directory.
#[derive(Debug, Clone)]
pub struct AtomicWriter {
    validator: PathValidator,
    locks: Arc<LockManager>,
}

impl AtomicWriter {
    /// Create a writer for `root`.
    pub fn new(root: impl Into<PathBuf>, locks: Arc<LockManager>) -> Self {
        Self {
            validator: PathValidator::new(root),
            locks,
        }
    }

    /// The data root.
    pub fn root(&self) -> &Path {
        self.validator.root()
    }

    /// The lock manager writes go through.
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Validate `rel_path` and return its absolute location.
    pub fn resolve(&self, rel_path: impl AsRef<Path>) -> Result<PathBuf, WriteError> {
        Ok(self.validator.resolve(rel_path.as_ref())?)
    }

    /// Replace `rel_path` with `content` while holding its lock.
    pub async fn atomic_write(
        &self,
        rel_path: impl AsRef<Path>,
        content: &[u8],
    ) -> Result<WriteReceipt, WriteError> {
        let target = self.resolve(rel_path)?;
        let _guard = self.locks.acquire(&target).await?;
        write_replacing(&target, content).await
    }

    /// Like [`atomic_write`](Self::atomic_write), with a byte-order marker
    /// prepended if `content` does not already start with one.
    pub async fn atomic_write_with_bom(
        &self,
        rel_path: impl AsRef<Path>,
        content: &[u8],
    ) -> Result<WriteReceipt, WriteError> {
        self.atomic_write(rel_path, &ensure_bom(content)).await
    }

    /// Read-modify-write a JSON file under its lock.
    ///
    /// An absent or unparseable file is treated as `empty_default`. The
    /// value handed back is exactly what was written.
    pub async fn modify_json_with_lock<T, F>(
        &self,
        rel_path: impl AsRef<Path>,
        mutate: F,
        empty_default: T,
    ) -> Result<(T, WriteReceipt), WriteError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(T) -> T,
    {
        let target = self.resolve(rel_path)?;
        let _guard = self.locks.acquire(&target).await?;

        let current = match tokio::fs::read(&target).await {
            Ok(bytes) => match serde_json::from_slice::<T>(strip_bom(&bytes)) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(
                        path = %target.display(),
                        error = %e,
                        "Existing file is not valid JSON, starting from empty"
                    );
                    empty_default
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => empty_default,
            Err(source) => return Err(WriteError::Io { path: target, source }),
        };

        let next = mutate(current);
        let mut content =
            serde_json::to_vec_pretty(&next).map_err(|source| WriteError::Serialize {
                path: target.clone(),
                source,
            })?;
        content.push(b'\n');

        let receipt = write_replacing(&target, &content).await?;
        Ok((next, receipt))
    }
}

/// Temp-write, flush and rename `content` over `target`.
///
/// The caller must already hold the target's lock.
async fn write_replacing(target: &Path, content: &[u8]) -> Result<WriteReceipt, WriteError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| WriteError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    let temp_path = temp_sibling(target);
    if let Err(source) = write_temp(&temp_path, content).await {
        discard(&temp_path).await;
        return Err(WriteError::Io {
            path: target.to_path_buf(),
            source,
        });
    }

    if let Err(source) = tokio::fs::rename(&temp_path, target).await {
        discard(&temp_path).await;
        return Err(WriteError::Io {
            path: target.to_path_buf(),
            source,
        });
    }

    let receipt = WriteReceipt {
        path: target.to_path_buf(),
        bytes: content.len() as u64,
        digest: digest(content),
    };
    tracing::debug!(
        path = %target.display(),
        bytes = receipt.bytes,
        "Wrote file atomically"
    );
    Ok(receipt)
}

async fn write_temp(temp_path: &Path, content: &[u8]) -> io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp_path)
        .await?;
    file.write_all(content).await?;
    file.flush().await?;
    file.sync_all().await
}

async fn discard(temp_path: &Path) {
    if let Err(e) = tokio::fs::remove_file(temp_path).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = ?temp_path, error = %e, "Failed to clean up temp file");
        }
    }
}
