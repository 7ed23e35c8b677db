//! Steward runtime: pulls keys off the work queue, looks up current state in
//! the store, and drives the injected reconcile action with retry and
//! backoff. Also owns startup (wait for initial sync) and shutdown
//! sequencing.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use steward_core::{FeedEvent, Reconcile, ReconcileError};
use steward_queue::{RateLimit, WorkQueue};
use steward_store::{spawn_ingest, StoreHandle};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The cache never completed its initial full list. Reconciling against
    /// an unsynced cache would act on a partial world, so this is fatal.
    #[error("cache did not complete initial sync within {0:?}")]
    SyncTimeout(Duration),
    #[error("feed closed before initial sync completed")]
    FeedClosed,
}

/// Bounded inline retry for transient conflicts: a handful of attempts with
/// a short fixed pause, after which the error escalates to a normal
/// reconcile failure.
#[derive(Debug, Clone)]
pub struct ConflictRetry {
    pub attempts: u32,
    pub pause: Duration,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self { attempts: 5, pause: Duration::from_millis(10) }
    }
}

/// Run `op`, retrying only [`ReconcileError::Conflict`] per `policy`.
pub async fn retry_on_conflict<F, Fut>(policy: &ConflictRetry, mut op: F) -> Result<(), ReconcileError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ReconcileError>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt < policy.attempts => {
                debug!(attempt, error = %e, "conflict; retrying");
                attempt += 1;
                tokio::time::sleep(policy.pause).await;
            }
            other => return other,
        }
    }
}

/// Controller tuning. Defaults mirror the upstream client library where one
/// exists (rate limiter base/cap, five conflict attempts).
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Parallel reconcile workers. Keys are still serialized per key.
    pub workers: usize,
    /// Hard deadline for the initial sync; exceeding it is fatal.
    pub sync_timeout: Duration,
    pub rate_limit: RateLimit,
    /// Drop a key after this many consecutive failures (`None` = retry
    /// forever). The drop is logged with the key and last error.
    pub max_retries: Option<u32>,
    pub conflict_retry: ConflictRetry,
    /// Feed channel capacity between the watcher and the ingest loop.
    pub feed_buffer: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            sync_timeout: Duration::from_secs(60),
            rate_limit: RateLimit::default(),
            max_retries: Some(16),
            conflict_retry: ConflictRetry::default(),
            feed_buffer: 2048,
        }
    }
}

/// Level-triggered reconciliation controller: cache + queue + worker pool.
///
/// Construction wires the store ingest loop to a fresh work queue and hands
/// back the feed sender; the embedder points its watcher at that sender and
/// then calls [`Controller::run`].
pub struct Controller<R: Reconcile + 'static> {
    queue: Arc<WorkQueue>,
    store: StoreHandle,
    ingest: JoinHandle<()>,
    action: Arc<R>,
    cfg: ControllerConfig,
}

impl<R: Reconcile + 'static> Controller<R> {
    pub fn new(action: Arc<R>, cfg: ControllerConfig) -> (Self, mpsc::Sender<FeedEvent>) {
        let queue = Arc::new(WorkQueue::with_rate_limit(cfg.rate_limit.clone()));
        let (feed_tx, store, ingest) = spawn_ingest(cfg.feed_buffer, Arc::clone(&queue));
        (Self { queue, store, ingest, action, cfg }, feed_tx)
    }

    /// Read access to the mirrored collection, e.g. for status endpoints.
    pub fn store(&self) -> StoreHandle {
        self.store.clone()
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Block until the cache has synced, then run reconcile workers until
    /// `shutdown` flips to `true` (or its sender is dropped, which is
    /// treated the same). Returns once every worker has drained its
    /// in-flight item and exited.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), RuntimeError> {
        let Self { queue, store, ingest, action, cfg } = self;

        match wait_for_sync(&store, cfg.sync_timeout, &mut shutdown).await {
            SyncOutcome::Synced => {}
            SyncOutcome::ShutdownRequested => {
                ingest.abort();
                queue.shut_down().await;
                return Ok(());
            }
            SyncOutcome::Fatal(e) => {
                ingest.abort();
                queue.shut_down().await;
                return Err(e);
            }
        }
        info!(workers = cfg.workers, "cache synced; starting reconcile workers");

        let mut handles = Vec::with_capacity(cfg.workers.max(1));
        for id in 0..cfg.workers.max(1) {
            handles.push(tokio::spawn(worker_loop(
                id,
                Arc::clone(&queue),
                store.clone(),
                Arc::clone(&action),
                cfg.conflict_retry.clone(),
                cfg.max_retries,
            )));
        }

        // Park until the embedder asks us to stop.
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        // Cut the feed first so drained workers cannot be re-fed, then let
        // blocked `get` calls observe shutdown and drain what is ready.
        info!("shutdown requested; stopping feed and draining workers");
        ingest.abort();
        queue.shut_down().await;
        for h in handles {
            let _ = h.await;
        }
        info!("controller stopped");
        Ok(())
    }
}

enum SyncOutcome {
    Synced,
    ShutdownRequested,
    Fatal(RuntimeError),
}

async fn wait_for_sync(
    store: &StoreHandle,
    timeout: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> SyncOutcome {
    let mut sync_rx = store.sync_state();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        if *sync_rx.borrow() {
            return SyncOutcome::Synced;
        }
        tokio::select! {
            changed = sync_rx.changed() => {
                if changed.is_err() {
                    return SyncOutcome::Fatal(RuntimeError::FeedClosed);
                }
            }
            _ = &mut deadline => {
                return SyncOutcome::Fatal(RuntimeError::SyncTimeout(timeout));
            }
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    return SyncOutcome::ShutdownRequested;
                }
            }
        }
    }
}

async fn worker_loop<R: Reconcile + 'static>(
    id: usize,
    queue: Arc<WorkQueue>,
    store: StoreHandle,
    action: Arc<R>,
    conflict: ConflictRetry,
    max_retries: Option<u32>,
) {
    while let Some(key) = queue.get().await {
        let started = Instant::now();
        // Re-fetch inside the retry: a conflicting writer usually means the
        // cache is about to catch up, and the next attempt should see it.
        let result = retry_on_conflict(&conflict, || {
            let obj = store.get(&key);
            action.reconcile(&key, obj)
        })
        .await;
        metrics::histogram!("reconcile_duration_ms", started.elapsed().as_secs_f64() * 1_000.0);

        match result {
            Ok(()) => {
                metrics::counter!("reconcile_success_total", 1u64);
                debug!(worker = id, %key, "reconciled");
                queue.forget(&key).await;
            }
            Err(e) => {
                metrics::counter!("reconcile_failures_total", 1u64);
                let failures = queue.retries(&key).await;
                match max_retries {
                    Some(max) if failures >= max => {
                        error!(worker = id, %key, error = %e, failures, "retries exhausted; dropping key");
                        queue.forget(&key).await;
                    }
                    _ => {
                        warn!(worker = id, %key, error = %e, failures, "reconcile failed; requeueing with backoff");
                        queue.add_rate_limited(key.clone()).await;
                    }
                }
            }
        }
        queue.done(&key).await;
    }
    debug!(worker = id, "worker exiting on queue shutdown");
}
