//! File manager: the mutation API over the cache and the data files.
//!
//! Every mutation follows the same path:
//!
//! ```text
//! Idle ─► Validating ─► OptimisticallyApplied ─► Persisting ─┬─► Committed
//!                                                            └─► RolledBack
//! ```
//!
//! Validation (rate limit, record checks, existence) happens before any I/O.
//! The cache then shows the new value at once, the same change is applied to
//! the file under its lock, and the cache is finally set to what was
//! actually written. If the write fails the cache goes back to its previous
//! value.
//!
//! Mutations on one collection are queued in call order: each holds that
//! collection's ordering lock from the optimistic update until the write
//! resolves. A full reload holds every ordering lock, so it never
//! interleaves with a half-finished mutation.

mod command;
mod contacts;
mod dummy;
mod echo;
mod groups;
mod loader;
mod oncall;
mod transfer;
mod value;

pub use command::{MutationCommand, MutationError, OperationResult};
pub use echo::{EchoEntry, EchoLedger};
pub use transfer::ImportSummary;
pub use value::CollectionValue;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use anyhow::{Context, Result};
use schema::{Collection, DataError, DataErrorKind, DataSnapshot};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::DataCacheManager;
use crate::context::SyncContext;
use crate::files::{digest, AtomicWriter};
use crate::ratelimit::OperationClass;
use crate::watcher::{FileChange, FileWatcher};

/// Lifecycle of a [`FileManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Created, nothing loaded.
    Idle,
    /// Loaded and reacting to external changes.
    Running,
    /// Torn down; cannot be restarted.
    Destroyed,
}

#[derive(Default)]
struct Background {
    watcher: Option<FileWatcher>,
    reaction: Option<JoinHandle<()>>,
}

/// Owns the cache and mediates every read and write of the data files.
pub struct FileManager {
    ctx: SyncContext,
    cache: Arc<DataCacheManager>,
    writer: AtomicWriter,
    echoes: EchoLedger,
    ordering: HashMap<Collection, Mutex<()>>,
    state: StdMutex<ManagerState>,
    background: StdMutex<Background>,
    shutdown: CancellationToken,
}

impl FileManager {
    /// Create a manager over the context's data root with an empty cache.
    pub fn new(ctx: SyncContext) -> Self {
        let writer = AtomicWriter::new(ctx.data_dir(), Arc::clone(&ctx.locks));
        let ordering = Collection::ALL
            .into_iter()
            .map(|c| (c, Mutex::new(())))
            .collect();

        Self {
            ctx,
            cache: Arc::new(DataCacheManager::new()),
            writer,
            echoes: EchoLedger::new(),
            ordering,
            state: StdMutex::new(ManagerState::Idle),
            background: StdMutex::new(Background::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// The shared context.
    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// The cache, for subscribing to events.
    pub fn cache(&self) -> &Arc<DataCacheManager> {
        &self.cache
    }

    /// Record of this manager's own writes.
    pub fn echoes(&self) -> &EchoLedger {
        &self.echoes
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current snapshot.
    pub fn get_cached_data(&self) -> Arc<DataSnapshot> {
        self.cache.get_cache()
    }

    /// Load every collection, then start reacting to external edits.
    ///
    /// A watcher that fails to start is reported as a data error; the
    /// manager keeps working and can still be synced manually.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                ManagerState::Idle => {}
                ManagerState::Running => anyhow::bail!("File manager is already running"),
                ManagerState::Destroyed => anyhow::bail!("File manager has been destroyed"),
            }
            *state = ManagerState::Running;
        }

        let root = self.ctx.data_dir().to_path_buf();
        if let Err(e) = tokio::fs::create_dir_all(&root).await {
            *self.state.lock().unwrap_or_else(PoisonError::into_inner) = ManagerState::Idle;
            return Err(e)
                .with_context(|| format!("Failed to create data directory: {}", root.display()));
        }

        info!(root = %root.display(), "Starting file manager");
        self.read_and_emit().await;

        let watcher_config = &self.ctx.config.watcher;
        if !watcher_config.enabled {
            info!("File watching disabled");
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        match FileWatcher::start(&root, watcher_config.debounce(), move |change| {
            let _ = tx.send(change);
        }) {
            Ok(watcher) => {
                let reaction = tokio::spawn(reaction_loop(
                    Arc::downgrade(self),
                    rx,
                    self.shutdown.clone(),
                ));
                let mut background = self.background.lock().unwrap_or_else(PoisonError::into_inner);
                background.watcher = Some(watcher);
                background.reaction = Some(reaction);
            }
            Err(e) => {
                self.cache.emit_error(
                    DataError::new(
                        DataErrorKind::Watcher,
                        "External changes will not be detected",
                    )
                    .with_details(e.to_string()),
                );
            }
        }

        Ok(())
    }

    /// Stop watching and cancel background work.
    ///
    /// Safe to call when never started and more than once.
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == ManagerState::Destroyed {
                return;
            }
            *state = ManagerState::Destroyed;
        }

        self.shutdown.cancel();
        let background = std::mem::take(
            &mut *self.background.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if let Some(watcher) = background.watcher {
            watcher.close();
        }
        if let Some(reaction) = background.reaction {
            reaction.abort();
        }
        info!("File manager destroyed");
    }

    /// Reload every collection from disk and replace the cache.
    ///
    /// A collection that fails to load keeps its previous value and is
    /// reported with a data error naming the file. Returns whether every
    /// collection loaded cleanly.
    pub async fn read_and_emit(&self) -> bool {
        let _guards = self.lock_all().await;
        self.cache.emit_reload_started();

        let mut snapshot = DataSnapshot::clone(&self.cache.get_cache());
        let mut success = true;
        for collection in Collection::ALL {
            let outcome = loader::load(&self.writer, collection).await;
            if let Some(err) = outcome.error {
                success = false;
                self.cache.emit_error(err);
            }
            for warning in outcome.warnings {
                self.cache.emit_error(warning);
            }
            if let Some(patch) = outcome.patch {
                patch.apply_to(&mut snapshot);
            }
        }

        self.cache.replace(snapshot);
        self.cache.emit_reload_completed(success);
        debug!(success, "Reload finished");
        success
    }

    /// A user-requested reload, subject to the reload rate limit.
    pub async fn sync(&self) -> Result<bool, MutationError> {
        self.admit(OperationClass::Reload)?;
        Ok(self.read_and_emit().await)
    }

    /// Take one token from `class` or refuse the call.
    fn admit(&self, class: OperationClass) -> Result<(), MutationError> {
        let decision = self.ctx.limiters.try_consume(class);
        if decision.allowed {
            Ok(())
        } else {
            Err(MutationError::RateLimited {
                class,
                retry_after_ms: decision.retry_after_ms,
            })
        }
    }

    async fn lock_collection(&self, collection: Collection) -> Option<MutexGuard<'_, ()>> {
        match self.ordering.get(&collection) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        }
    }

    async fn lock_all(&self) -> Vec<MutexGuard<'_, ()>> {
        let mut guards = Vec::with_capacity(Collection::ALL.len());
        // Fixed order; mutations only ever hold one of these.
        for collection in Collection::ALL {
            if let Some(guard) = self.lock_collection(collection).await {
                guards.push(guard);
            }
        }
        guards
    }

    /// Run one mutation through validate, apply, persist and commit or
    /// rollback.
    ///
    /// `check` sees the cache as it stands once this call reaches the front
    /// of the collection's queue and may refuse the mutation. `op` is applied
    /// twice: to the cached value for the optimistic update and to the value
    /// read from disk under the lock.
    async fn run<T, C, F>(&self, name: &'static str, check: C, op: F) -> Result<(), MutationError>
    where
        T: CollectionValue,
        C: FnOnce(&T) -> Result<(), MutationError>,
        F: Fn(T) -> T,
    {
        let collection = T::COLLECTION;
        let _order = self.lock_collection(collection).await;

        let before = T::from_snapshot(&self.cache.get_cache());
        check(&before)?;
        let after = op(before.clone());

        let command = MutationCommand::new(
            name,
            before.into_patch(),
            after.into_patch(),
            &self.cache,
        );
        command.apply(&self.cache);

        match self
            .writer
            .modify_json_with_lock(collection.file_name(), |disk: T| op(disk), T::default())
            .await
        {
            Ok((written, receipt)) => {
                self.echoes.record(collection, &receipt);
                command.commit(&self.cache, written.into_patch());
                debug!(
                    op = name,
                    collection = %collection,
                    bytes = receipt.bytes,
                    "Mutation committed"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    op = name,
                    collection = %collection,
                    error = %e,
                    "Mutation failed, rolling back"
                );
                command.rollback(&self.cache);
                self.cache.emit_error(
                    DataError::new(DataErrorKind::Persistence, format!("{name} failed"))
                        .with_file(collection.file_name())
                        .with_details(e.to_string()),
                );
                Err(MutationError::from(e))
            }
        }
    }

    /// Whether every reported change is our own write.
    async fn all_echoes(&self, collections: &[Collection]) -> bool {
        for &collection in collections {
            let path = match self.writer.resolve(collection.file_name()) {
                Ok(path) => path,
                Err(_) => return false,
            };
            let current = match tokio::fs::read(&path).await {
                Ok(bytes) => digest(&bytes),
                Err(_) => return false,
            };
            if !self.echoes.is_echo(collection, &current) {
                debug!(collection = %collection, "External change detected");
                return false;
            }
        }
        true
    }
}

impl Drop for FileManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for FileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileManager")
            .field("root", &self.ctx.data_dir())
            .field("state", &self.state())
            .finish()
    }
}

/// Turn watcher reports into reloads until shutdown.
async fn reaction_loop(
    manager: Weak<FileManager>,
    mut changes: mpsc::UnboundedReceiver<FileChange>,
    shutdown: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = shutdown.cancelled() => break,
            change = changes.recv() => match change {
                Some(change) => change,
                None => break,
            },
        };

        let mut collections = vec![first.collection];
        while let Ok(change) = changes.try_recv() {
            if !collections.contains(&change.collection) {
                collections.push(change.collection);
            }
        }

        let Some(strong) = manager.upgrade() else {
            break;
        };
        if strong.all_echoes(&collections).await {
            debug!(?collections, "Ignoring change caused by our own write");
            continue;
        }
        info!(?collections, "Data files changed on disk, reloading");
        if !strong.read_and_emit().await {
            warn!("Reload after external change finished with errors");
        }
    }
}
