//! Cooperative cross-process file locking.
//!
//! A lock on `contacts.json` is the sidecar file `contacts.json.lock`,
//! created with `create_new` so that exactly one creator wins. The sidecar
//! holds a [`LockRecord`] naming the owner and the lease it was taken with.
//! A holder that crashes leaves the sidecar behind; once the lease has
//! expired any waiter may reclaim it.
//!
//! The lock is advisory. Every Relay process honours it, but an editor or a
//! script writing the data files directly does not, which is why external
//! edits are picked up by the watcher instead.
//!
//! Within one process, callers locking the same file first queue on a fair
//! async mutex, so they acquire in call order and never poll each other.

use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use schema::unix_millis;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

use crate::config::LockConfig;

/// Errors that can occur while taking or releasing a lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock stayed held by someone else for the whole acquire timeout.
    #[error("timed out after {waited_ms}ms waiting for lock on {path}{}", holder_suffix(.holder))]
    Timeout {
        path: PathBuf,
        waited_ms: u64,
        holder: Option<String>,
    },

    /// The sidecar could not be created, read or removed.
    #[error("lock I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn holder_suffix(holder: &Option<String>) -> String {
    match holder {
        Some(holder) => format!(" (held by {holder})"),
        None => String::new(),
    }
}

/// Contents of a lock sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    /// Identifier of the lock manager that took the lock.
    pub owner: String,
    /// Unique per acquisition; lets a holder tell its own sidecar apart.
    pub nonce: String,
    /// Process id of the holder.
    pub pid: u32,
    /// Wall-clock acquisition time, milliseconds since the Unix epoch.
    pub acquired_at_ms: u64,
    /// Lease the lock was taken with.
    pub lease_ms: u64,
}

impl LockRecord {
    /// Whether the lease has run out as of `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.acquired_at_ms) > self.lease_ms
    }

    fn holder(&self) -> String {
        format!("{} (pid {})", self.owner, self.pid)
    }
}

/// What is currently known about a lock sidecar.
#[derive(Debug, Clone)]
pub struct LockInfo {
    /// Parsed record, or `None` when the sidecar is unreadable.
    pub record: Option<LockRecord>,
    /// Age of the sidecar.
    pub age: Duration,
    /// Whether a waiter may reclaim it.
    pub stale: bool,
    /// Whether the holding process still exists, where that can be checked.
    pub owner_alive: Option<bool>,
}

/// Path of the sidecar guarding `target`.
pub fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}

/// Check whether a process exists.
///
/// Only used for diagnostics: liveness never decides staleness, since a pid
/// may be reused and the holder may live on another machine sharing the
/// data folder.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> Option<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).ok()?;
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => Some(true),
        Err(Errno::EPERM) => Some(true),
        Err(Errno::ESRCH) => Some(false),
        Err(_) => None,
    }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> Option<bool> {
    None
}

enum SidecarState {
    /// Sidecar disappeared between the failed create and the read.
    Gone,
    /// Held by someone else.
    Held { holder: Option<String> },
    /// Abandoned; `bytes` is what was read so reclamation can verify it.
    Stale { bytes: Vec<u8>, holder: Option<String> },
}

/// Hands out per-file locks for one owner.
#[derive(Debug)]
pub struct LockManager {
    owner: String,
    lease: Duration,
    acquire_timeout: Duration,
    retry_interval: Duration,
    registry: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl LockManager {
    /// Create a manager with a fresh random owner id.
    pub fn new(config: &LockConfig) -> Self {
        Self::with_owner(uuid::Uuid::new_v4().to_string(), config)
    }

    /// Create a manager with an explicit owner id.
    pub fn with_owner(owner: impl Into<String>, config: &LockConfig) -> Self {
        Self::with_timings(
            owner,
            config.lease(),
            config.acquire_timeout(),
            config.retry_interval(),
        )
    }

    /// Create a manager with explicit timings.
    pub fn with_timings(
        owner: impl Into<String>,
        lease: Duration,
        acquire_timeout: Duration,
        retry_interval: Duration,
    ) -> Self {
        Self {
            owner: owner.into(),
            lease,
            acquire_timeout,
            retry_interval: retry_interval.max(Duration::from_millis(1)),
            registry: DashMap::new(),
        }
    }

    /// Owner id written into every sidecar.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Lease written into every sidecar.
    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Run `f` while holding the lock on `target`.
    ///
    /// The lock is released when `f` finishes, including when its future is
    /// dropped early.
    pub async fn with_lock<F, Fut, T>(&self, target: &Path, f: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire(target).await?;
        let result = f().await;
        drop(guard);
        Ok(result)
    }

    /// Take the lock on `target`, waiting up to the acquire timeout.
    pub async fn acquire(&self, target: &Path) -> Result<LockGuard, LockError> {
        let started = Instant::now();
        let deadline = started + self.acquire_timeout;
        let lock_path = lock_path_for(target);

        let local = self
            .registry
            .entry(target.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let local_guard = match tokio::time::timeout_at(deadline, local.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                return Err(LockError::Timeout {
                    path: target.to_path_buf(),
                    waited_ms: elapsed_ms(started),
                    holder: Some(format!("{} (this process)", self.owner)),
                });
            }
        };

        loop {
            let record = LockRecord {
                owner: self.owner.clone(),
                nonce: uuid::Uuid::new_v4().to_string(),
                pid: std::process::id(),
                acquired_at_ms: unix_millis(),
                lease_ms: duration_ms(self.lease),
            };

            let holder = match create_sidecar(&lock_path, &record) {
                Ok(()) => {
                    tracing::debug!(
                        path = %target.display(),
                        waited_ms = elapsed_ms(started),
                        "Lock acquired"
                    );
                    return Ok(LockGuard {
                        lock_path,
                        nonce: record.nonce,
                        released: false,
                        _local: local_guard,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match self.classify(&lock_path) {
                        SidecarState::Gone => continue,
                        SidecarState::Stale { bytes, holder } => {
                            tracing::warn!(
                                path = %target.display(),
                                holder = holder.as_deref().unwrap_or("unknown"),
                                "Reclaiming stale lock"
                            );
                            reclaim(&lock_path, &bytes)?;
                            continue;
                        }
                        SidecarState::Held { holder } => holder,
                    }
                }
                Err(source) => {
                    return Err(LockError::Io {
                        path: lock_path,
                        source,
                    });
                }
            };

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    path = %target.display(),
                    holder = holder.as_deref().unwrap_or("unknown"),
                    "Lock acquisition timed out"
                );
                return Err(LockError::Timeout {
                    path: target.to_path_buf(),
                    waited_ms: elapsed_ms(started),
                    holder,
                });
            }
            tokio::time::sleep(self.retry_interval.min(deadline - now)).await;
        }
    }

    /// Describe the sidecar guarding `target`, if there is one.
    pub fn inspect(&self, target: &Path) -> Result<Option<LockInfo>, LockError> {
        let lock_path = lock_path_for(target);
        let bytes = match fs::read(&lock_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(LockError::Io {
                    path: lock_path,
                    source,
                })
            }
        };
        let age = sidecar_age(&lock_path).unwrap_or_default();
        let record = serde_json::from_slice::<LockRecord>(&bytes).ok();
        let stale = self.is_stale(record.as_ref(), age);
        let owner_alive = record.as_ref().and_then(|r| process_alive(r.pid));

        Ok(Some(LockInfo {
            record,
            age,
            stale,
            owner_alive,
        }))
    }

    fn is_stale(&self, record: Option<&LockRecord>, age: Duration) -> bool {
        match record {
            Some(record) => record.is_expired(unix_millis()),
            // Unreadable or half-written: fall back to the file's age.
            None => age > self.lease,
        }
    }

    fn classify(&self, lock_path: &Path) -> SidecarState {
        let bytes = match fs::read(lock_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return SidecarState::Gone,
            Err(e) => {
                tracing::debug!(path = %lock_path.display(), error = %e, "Failed to read lock");
                return SidecarState::Held { holder: None };
            }
        };
        let record = serde_json::from_slice::<LockRecord>(&bytes).ok();
        let holder = record.as_ref().map(LockRecord::holder);
        let age = match sidecar_age(lock_path) {
            Some(age) => age,
            None => return SidecarState::Gone,
        };

        if self.is_stale(record.as_ref(), age) {
            SidecarState::Stale { bytes, holder }
        } else {
            SidecarState::Held { holder }
        }
    }
}

/// Holds a file lock until dropped.
#[derive(Debug)]
pub struct LockGuard {
    lock_path: PathBuf,
    nonce: String,
    released: bool,
    _local: OwnedMutexGuard<()>,
}

impl LockGuard {
    /// Path of the sidecar this guard owns.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Release the lock now, reporting failures instead of logging them.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.remove_sidecar()
    }

    fn remove_sidecar(&self) -> Result<(), LockError> {
        let bytes = match fs::read(&self.lock_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(LockError::Io {
                    path: self.lock_path.clone(),
                    source,
                })
            }
        };

        let ours = serde_json::from_slice::<LockRecord>(&bytes)
            .map(|r| r.nonce == self.nonce)
            .unwrap_or(false);
        if !ours {
            // Our lease ran out and someone else reclaimed the lock.
            tracing::warn!(
                path = %self.lock_path.display(),
                "Lock was reclaimed by another owner before release"
            );
            return Ok(());
        }

        match fs::remove_file(&self.lock_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LockError::Io {
                path: self.lock_path.clone(),
                source,
            }),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.remove_sidecar() {
            tracing::warn!(error = %e, "Failed to release lock");
        }
    }
}

fn create_sidecar(lock_path: &Path, record: &LockRecord) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)?;

    let written = serde_json::to_vec(record)
        .map_err(io::Error::other)
        .and_then(|bytes| {
            file.write_all(&bytes)?;
            file.sync_all()
        });

    if let Err(e) = written {
        // A sidecar we cannot fill in would block everyone for a full lease.
        let _ = fs::remove_file(lock_path);
        return Err(e);
    }
    Ok(())
}

/// Remove a stale sidecar, unless it changed since it was judged stale.
fn reclaim(lock_path: &Path, seen: &[u8]) -> Result<(), LockError> {
    let mut tombstone_name = lock_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tombstone_name.push(format!(".{}.stale", uuid::Uuid::new_v4().simple()));
    let tombstone = lock_path.with_file_name(tombstone_name);

    match fs::rename(lock_path, &tombstone) {
        Ok(()) => {}
        // Another waiter reclaimed it first.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(LockError::Io {
                path: lock_path.to_path_buf(),
                source,
            })
        }
    }

    let moved = fs::read(&tombstone).unwrap_or_default();
    if moved != seen {
        // The stale holder was replaced by a live one between our read and
        // the rename. Put the live lock back.
        restore_moved_lock(&tombstone, lock_path, &moved);
    }

    let _ = fs::remove_file(&tombstone);
    Ok(())
}

/// Put a sidecar moved aside by [`reclaim`] back at `lock_path`.
///
/// Never replaces a sidecar created at `lock_path` in the meantime. The
/// caller removes `tombstone` afterwards.
fn restore_moved_lock(tombstone: &Path, lock_path: &Path, moved: &[u8]) {
    tracing::debug!(path = %lock_path.display(), "Restoring lock moved during reclaim");
    let restored = match fs::hard_link(tombstone, lock_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(e),
        // Hard links are not available everywhere; fall back to an
        // exclusive create so a newer sidecar still wins.
        Err(_) => OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
            .and_then(|mut file| {
                file.write_all(moved)?;
                file.sync_all()
            }),
    };

    if let Err(e) = restored {
        tracing::warn!(
            path = %lock_path.display(),
            error = %e,
            "Dropped moved lock, the sidecar was taken before it could be restored"
        );
    }
}

fn sidecar_age(lock_path: &Path) -> Option<Duration> {
    let modified = fs::metadata(lock_path).and_then(|m| m.modified()).ok()?;
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default(),
    )
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn elapsed_ms(started: Instant) -> u64 {
    duration_ms(started.elapsed())
}
