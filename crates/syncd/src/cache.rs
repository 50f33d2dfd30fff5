//! In-memory data cache and change broadcast.
//!
//! The cache holds one immutable [`DataSnapshot`] behind an `Arc`. Readers
//! clone the `Arc` and never block writers for longer than a pointer swap.
//! Every change is broadcast as a [`DataEvent`] so views can re-render.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use schema::{unix_millis, CachePatch, DataError, DataEvent, DataSnapshot};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Capacity of the event channel. Slow subscribers skip ahead past lagged
/// events; the latest snapshot is always available from [`DataCacheManager::get_cache`].
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Handle for a callback registered with [`DataCacheManager::subscribe`].
///
/// The callback stops when the handle is dropped.
#[derive(Debug)]
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Stop delivering events to the callback.
    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Owner of the current snapshot.
#[derive(Debug)]
pub struct DataCacheManager {
    snapshot: RwLock<Arc<DataSnapshot>>,
    generation: AtomicU64,
    event_tx: broadcast::Sender<DataEvent>,
}

impl DataCacheManager {
    /// Create an empty cache.
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            snapshot: RwLock::new(Arc::new(DataSnapshot::default())),
            generation: AtomicU64::new(0),
            event_tx,
        }
    }

    /// The current snapshot.
    pub fn get_cache(&self) -> Arc<DataSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace one collection and broadcast the result.
    pub fn update_cache(&self, patch: CachePatch) -> Arc<DataSnapshot> {
        let collection = patch.collection();
        let updated = {
            let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
            let mut next = DataSnapshot::clone(&guard);
            patch.apply_to(&mut next);
            next.last_updated = unix_millis();
            let next = Arc::new(next);
            *guard = Arc::clone(&next);
            next
        };
        debug!(collection = %collection, "Cache updated");
        self.broadcast(DataEvent::DataUpdated(Arc::clone(&updated)));
        updated
    }

    /// Swap in a freshly loaded snapshot and broadcast it.
    ///
    /// Bumps the reload generation, which lets a pending rollback detect that
    /// it has been superseded.
    pub fn replace(&self, mut snapshot: DataSnapshot) -> Arc<DataSnapshot> {
        snapshot.last_updated = unix_millis();
        let snapshot = Arc::new(snapshot);
        {
            let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
            *guard = Arc::clone(&snapshot);
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        self.broadcast(DataEvent::DataUpdated(Arc::clone(&snapshot)));
        snapshot
    }

    /// Number of full replacements so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Announce the start of a full reload.
    pub fn emit_reload_started(&self) {
        self.broadcast(DataEvent::ReloadStarted);
    }

    /// Announce the end of a full reload.
    pub fn emit_reload_completed(&self, success: bool) {
        self.broadcast(DataEvent::ReloadCompleted { success });
    }

    /// Report a load or persistence failure.
    pub fn emit_error(&self, error: DataError) {
        warn!(kind = %error.kind, file = ?error.file, "{}", error.message);
        self.broadcast(DataEvent::DataError(error));
    }

    /// A raw receiver for every event from now on.
    pub fn events(&self) -> broadcast::Receiver<DataEvent> {
        self.event_tx.subscribe()
    }

    /// Number of live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.event_tx.receiver_count()
    }

    /// Run `handler` for every event until the returned handle is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(DataEvent) + Send + 'static,
    {
        let mut events = self.event_tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Cache subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task: Some(task) }
    }

    fn broadcast(&self, event: DataEvent) {
        // No receivers is fine: the snapshot is still readable.
        let _ = self.event_tx.send(event);
    }
}

impl Default for DataCacheManager {
    fn default() -> Self {
        Self::new()
    }
}
