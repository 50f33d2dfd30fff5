//! Data directory watcher.
//!
//! Raw filesystem events arrive in bursts: one save from an editor is often
//! a create, several modifies and a rename. The watcher maps every event to
//! the collection whose file it touched and reports each collection once,
//! after no further events for it have arrived for the debounce window.
//!
//! ```text
//! RecommendedWatcher (notify thread)
//!        │  FileChange
//!        ▼
//! mpsc::UnboundedSender ──► debounce task (tokio) ──► handler
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use schema::Collection;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors that can occur while starting the watcher.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The data root does not exist.
    #[error("data directory does not exist: {0}")]
    MissingRoot(PathBuf),

    /// The platform watcher could not be created.
    #[error("failed to watch data directory: {0}")]
    Notify(#[from] notify::Error),
}

/// A debounced change to one collection's file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    /// The collection whose file changed.
    pub collection: Collection,
    /// Path of the changed file as reported by the platform.
    pub path: PathBuf,
}

/// Map a reported path to the collection it stores.
///
/// Lock sidecars, temp files and anything else in the directory are
/// ignored.
pub fn classify(path: &Path) -> Option<Collection> {
    let name = path.file_name()?.to_str()?;
    Collection::from_file_name(name)
}

/// Watches the data root until closed.
pub struct FileWatcher {
    root: PathBuf,
    watcher: Mutex<Option<RecommendedWatcher>>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl FileWatcher {
    /// Start watching `root`, calling `handler` once per settled change.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F>(root: &Path, debounce: Duration, handler: F) -> Result<Self, WatchError>
    where
        F: Fn(FileChange) + Send + Sync + 'static,
    {
        if !root.is_dir() {
            return Err(WatchError::MissingRoot(root.to_path_buf()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    for path in event.paths {
                        if let Some(collection) = classify(&path) {
                            // The receiver is gone once the watcher is closing.
                            let _ = tx.send(FileChange { collection, path });
                        }
                    }
                }
                Err(e) => warn!(error = %e, "File watcher error"),
            }
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(debounce_loop(
            rx,
            debounce,
            cancel.clone(),
            handler,
        ));

        info!(
            root = %root.display(),
            debounce_ms = debounce.as_millis() as u64,
            "Watching data directory"
        );

        Ok(Self {
            root: root.to_path_buf(),
            watcher: Mutex::new(Some(watcher)),
            task: Mutex::new(Some(task)),
            cancel,
        })
    }

    /// The watched directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop watching. Pending debounced changes are dropped.
    ///
    /// Safe to call more than once.
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();

        // Dropping the platform watcher unregisters it.
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(watcher);

        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        debug!(root = %self.root.display(), "File watcher closed");
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher")
            .field("root", &self.root)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn debounce_loop<F>(
    mut rx: mpsc::UnboundedReceiver<FileChange>,
    debounce: Duration,
    cancel: CancellationToken,
    handler: F,
) where
    F: Fn(FileChange) + Send + Sync + 'static,
{
    let mut pending: HashMap<Collection, (PathBuf, Instant)> = HashMap::new();

    loop {
        let next_due = pending.values().map(|(_, due)| *due).min();

        tokio::select! {
            _ = cancel.cancelled() => break,
            change = rx.recv() => match change {
                Some(change) => {
                    pending.insert(change.collection, (change.path, Instant::now() + debounce));
                }
                None => break,
            },
            _ = sleep_until_due(next_due), if next_due.is_some() => {
                let now = Instant::now();
                let due: Vec<Collection> = pending
                    .iter()
                    .filter(|(_, (_, at))| *at <= now)
                    .map(|(collection, _)| *collection)
                    .collect();
                for collection in due {
                    if let Some((path, _)) = pending.remove(&collection) {
                        debug!(collection = %collection, "Collection file changed");
                        handler(FileChange { collection, path });
                    }
                }
            }
        }
    }
}

async fn sleep_until_due(due: Option<Instant>) {
    if let Some(due) = due {
        tokio::time::sleep_until(due).await;
    }
}
