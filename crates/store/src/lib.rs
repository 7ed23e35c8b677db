//! Steward store: a thread-safe mirror of the watched collection, kept
//! current by a feed of [`FeedEvent`]s and published to readers as immutable
//! snapshots.
//!
//! A single ingest task owns the mutable state. Events are coalesced per key
//! and applied in small ticked batches; each batch freezes a new
//! [`StoreSnapshot`] into an `ArcSwap` before the touched keys are submitted
//! to the work queue, so a consumer that receives a key always sees at least
//! the state that caused the notification.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use steward_core::{FeedEvent, ObjectRef, ResourceKey, ResourceSnapshot};
use steward_queue::WorkQueue;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Immutable view of the mirrored collection at one point in time.
#[derive(Default)]
pub struct StoreSnapshot {
    pub epoch: u64,
    pub items: FxHashMap<ResourceKey, Arc<ResourceSnapshot>>,
}

/// A coalesced mutation: latest observed state for one key.
enum Pending {
    Applied(ResourceSnapshot),
    Deleted(ObjectRef),
}

/// Coalescing buffer keyed by resource key with FIFO order of first arrival.
/// Later events for a key replace earlier ones; level-triggered consumers
/// only act on latest state, and every touched key still gets notified.
struct Coalescer {
    map: FxHashMap<ResourceKey, Pending>,
    order: VecDeque<ResourceKey>,
}

impl Coalescer {
    fn new() -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new() }
    }

    fn push(&mut self, key: ResourceKey, p: Pending) {
        if !self.map.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.map.insert(key, p);
    }

    fn drain_ready(&mut self) -> Vec<(ResourceKey, Pending)> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(p) = self.map.remove(&key) {
                out.push((key, p));
            }
        }
        out
    }

    fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Builds successive [`StoreSnapshot`]s; owned by the ingest task.
struct WorldBuilder {
    epoch: u64,
    items: FxHashMap<ResourceKey, Arc<ResourceSnapshot>>,
}

impl WorldBuilder {
    fn new() -> Self {
        Self { epoch: 0, items: FxHashMap::default() }
    }

    /// Apply a coalesced batch; returns the touched keys in batch order.
    fn apply(&mut self, batch: Vec<(ResourceKey, Pending)>) -> Vec<ResourceKey> {
        let mut touched = Vec::with_capacity(batch.len());
        for (key, p) in batch {
            match p {
                Pending::Applied(snap) => {
                    self.items.insert(key.clone(), Arc::new(snap));
                }
                Pending::Deleted(_) => {
                    self.items.remove(&key);
                }
            }
            touched.push(key);
        }
        self.epoch = self.epoch.saturating_add(1);
        touched
    }

    /// Replace the whole world after a relist. Keys that vanished across the
    /// relist are reported too, so consumers observe them as deletions.
    fn replace_all(&mut self, list: Vec<ResourceSnapshot>) -> Vec<ResourceKey> {
        let mut next: FxHashMap<ResourceKey, Arc<ResourceSnapshot>> = FxHashMap::default();
        let mut touched = Vec::with_capacity(list.len());
        for snap in list {
            let key = snap.key();
            touched.push(key.clone());
            next.insert(key, Arc::new(snap));
        }
        for key in self.items.keys() {
            if !next.contains_key(key) {
                touched.push(key.clone());
            }
        }
        self.items = next;
        self.epoch = self.epoch.saturating_add(1);
        touched
    }

    fn freeze(&self) -> Arc<StoreSnapshot> {
        Arc::new(StoreSnapshot { epoch: self.epoch, items: self.items.clone() })
    }
}

/// Read handle for consumers: lock-free snapshot access plus the sync flag.
#[derive(Clone)]
pub struct StoreHandle {
    snap: Arc<ArcSwap<StoreSnapshot>>,
    synced_rx: watch::Receiver<bool>,
}

impl StoreHandle {
    pub fn current(&self) -> Arc<StoreSnapshot> {
        self.snap.load_full()
    }

    /// Lookup by key. `None` means the resource is gone; that is the signal
    /// for the reconcile action's deletion branch, not an error.
    pub fn get(&self, key: &ResourceKey) -> Option<Arc<ResourceSnapshot>> {
        self.snap.load().items.get(key).cloned()
    }

    /// Flips to `true` once, after the first full relist has been applied.
    pub fn sync_state(&self) -> watch::Receiver<bool> {
        self.synced_rx.clone()
    }

    pub fn has_synced(&self) -> bool {
        *self.synced_rx.borrow()
    }
}

/// Spawn the ingest loop. Feed events go into the returned sender; touched
/// keys come out on `queue` after each snapshot swap. The loop exits when
/// the sender side is dropped, flushing whatever is buffered.
pub fn spawn_ingest(
    cap: usize,
    queue: Arc<WorkQueue>,
) -> (mpsc::Sender<FeedEvent>, StoreHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<FeedEvent>(cap);
    let snap = Arc::new(ArcSwap::from_pointee(StoreSnapshot::default()));
    let (synced_tx, synced_rx) = watch::channel(false);
    let snap_writer = Arc::clone(&snap);

    let task = tokio::spawn(async move {
        let mut coalescer = Coalescer::new();
        let mut builder = WorldBuilder::new();
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(8));

        // Publish the applied batch, then notify. Order matters: a consumer
        // holding a key must find at least the state that produced it.
        async fn flush(
            coalescer: &mut Coalescer,
            builder: &mut WorldBuilder,
            snap: &ArcSwap<StoreSnapshot>,
            queue: &WorkQueue,
        ) {
            if coalescer.is_empty() {
                return;
            }
            let touched = builder.apply(coalescer.drain_ready());
            snap.store(builder.freeze());
            metrics::gauge!("store_items", builder.items.len() as f64);
            for key in touched {
                queue.add(key).await;
            }
        }

        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(FeedEvent::Applied(snapshot)) => {
                            coalescer.push(snapshot.key(), Pending::Applied(snapshot));
                        }
                        Some(FeedEvent::Deleted(tombstone)) => {
                            coalescer.push(tombstone.key(), Pending::Deleted(tombstone));
                        }
                        Some(FeedEvent::Restarted(list)) => {
                            // A relist supersedes anything buffered.
                            flush(&mut coalescer, &mut builder, &snap_writer, &queue).await;
                            debug!(count = list.len(), "feed relist");
                            let touched = builder.replace_all(list);
                            snap_writer.store(builder.freeze());
                            metrics::gauge!("store_items", builder.items.len() as f64);
                            for key in touched {
                                queue.add(key).await;
                            }
                            if !*synced_tx.borrow() {
                                let _ = synced_tx.send(true);
                            }
                        }
                        None => {
                            debug!("feed channel closed; flushing and exiting ingest loop");
                            flush(&mut coalescer, &mut builder, &snap_writer, &queue).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    flush(&mut coalescer, &mut builder, &snap_writer, &queue).await;
                }
            }
        }
        info!("ingest loop stopped");
    });

    (tx, StoreHandle { snap, synced_rx }, task)
}
