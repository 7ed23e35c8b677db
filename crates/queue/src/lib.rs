//! Steward work queue: dedup while queued, at most one in-flight holder per
//! key, exponential per-key backoff for failed work.
//!
//! Producers call [`WorkQueue::add`] from feed callbacks; one or more
//! consumers loop on [`WorkQueue::get`] / [`WorkQueue::done`]. The queue is
//! the only synchronization point between the two sides.

#![forbid(unsafe_code)]

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use steward_core::ResourceKey;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

/// Per-key exponential backoff parameters: `base * 2^retries`, capped.
#[derive(Debug, Clone)]
pub struct RateLimit {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self { base_delay: Duration::from_millis(5), max_delay: Duration::from_secs(1000) }
    }
}

impl RateLimit {
    fn delay_for(&self, retries: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retries.min(32)))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledEntry {
    at: Instant,
    key: ResourceKey,
}

impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at).then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Inner {
    /// FIFO of keys ready to hand out.
    queue: VecDeque<ResourceKey>,
    /// Keys waiting in `queue`, plus keys marked for re-add while in-flight.
    dirty: FxHashSet<ResourceKey>,
    /// Keys currently held by a consumer.
    processing: FxHashSet<ResourceKey>,
    /// Consecutive failure count per key; cleared by `forget`.
    retries: FxHashMap<ResourceKey, u32>,
    /// Backoff re-adds not yet eligible, ordered by deadline.
    scheduled: BinaryHeap<Reverse<ScheduledEntry>>,
    shutting_down: bool,
}

impl Inner {
    /// Same dedup rules as `add`, shared by the direct and scheduled paths.
    fn enqueue(&mut self, key: ResourceKey) -> bool {
        if self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            // Will be re-added by `done`.
            return false;
        }
        self.queue.push_back(key);
        true
    }

    /// Move every scheduled entry whose deadline has passed into the queue.
    fn promote_due(&mut self, now: Instant) -> bool {
        let mut moved = false;
        while let Some(Reverse(head)) = self.scheduled.peek() {
            if head.at > now {
                break;
            }
            let Some(Reverse(entry)) = self.scheduled.pop() else { break };
            moved |= self.enqueue(entry.key);
        }
        moved
    }
}

/// Deduplicating, rate-limited work queue keyed by [`ResourceKey`].
///
/// Shutdown drain policy: keys already in the ready queue stay retrievable
/// until the queue is empty, after which `get` returns `None`; backoff
/// re-adds that have not yet become eligible are discarded, and `add` after
/// shutdown is ignored.
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    limit: RateLimit,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::with_rate_limit(RateLimit::default())
    }

    pub fn with_rate_limit(limit: RateLimit) -> Self {
        Self { inner: Mutex::new(Inner::default()), notify: Notify::new(), limit }
    }

    /// Submit a key for processing. No-op if the key is already queued; if
    /// the key is in-flight it is marked dirty and re-added on `done`.
    pub async fn add(&self, key: ResourceKey) {
        let woke = {
            let mut q = self.inner.lock().await;
            if q.shutting_down {
                return;
            }
            let added = q.enqueue(key);
            metrics::counter!("workqueue_adds_total", 1u64);
            metrics::gauge!("workqueue_depth", q.queue.len() as f64);
            added
        };
        if woke {
            self.notify.notify_one();
        }
    }

    /// Re-add a key after its exponential backoff delay, bumping the per-key
    /// failure counter.
    pub async fn add_rate_limited(&self, key: ResourceKey) {
        {
            let mut q = self.inner.lock().await;
            if q.shutting_down {
                return;
            }
            let n = q.retries.entry(key.clone()).or_insert(0);
            let delay = self.limit.delay_for(*n);
            *n += 1;
            debug!(%key, retries = *n, ?delay, "rate-limited requeue");
            q.scheduled.push(Reverse(ScheduledEntry { at: Instant::now() + delay, key }));
            metrics::counter!("workqueue_retries_total", 1u64);
        }
        // A blocked consumer may need to recompute its sleep deadline.
        self.notify.notify_one();
    }

    /// Reset the per-key failure counter. Call on reconcile success.
    pub async fn forget(&self, key: &ResourceKey) {
        let mut q = self.inner.lock().await;
        q.retries.remove(key);
    }

    /// Consecutive failures recorded for a key since its last `forget`.
    pub async fn retries(&self, key: &ResourceKey) -> u32 {
        let q = self.inner.lock().await;
        q.retries.get(key).copied().unwrap_or(0)
    }

    /// Block until a key is eligible, or return `None` on shutdown once the
    /// ready queue has drained. The returned key is held in-flight until
    /// `done` is called for it.
    pub async fn get(&self) -> Option<ResourceKey> {
        loop {
            let notified = self.notify.notified();
            let deadline = {
                let mut q = self.inner.lock().await;
                q.promote_due(Instant::now());
                if let Some(key) = q.queue.pop_front() {
                    q.dirty.remove(&key);
                    q.processing.insert(key.clone());
                    metrics::gauge!("workqueue_depth", q.queue.len() as f64);
                    return Some(key);
                }
                if q.shutting_down {
                    return None;
                }
                q.scheduled.peek().map(|Reverse(e)| e.at)
            };
            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release an in-flight key. If it was dirtied while held, it goes
    /// straight back on the queue.
    pub async fn done(&self, key: &ResourceKey) {
        let requeued = {
            let mut q = self.inner.lock().await;
            q.processing.remove(key);
            if q.dirty.contains(key) {
                q.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop the queue: blocked `get` calls return promptly (after draining
    /// the ready queue), pending backoff re-adds are dropped, and further
    /// `add`s are ignored.
    pub async fn shut_down(&self) {
        {
            let mut q = self.inner.lock().await;
            q.shutting_down = true;
            q.scheduled.clear();
        }
        self.notify.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        let q = self.inner.lock().await;
        q.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_shutting_down(&self) -> bool {
        let q = self.inner.lock().await;
        q.shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    fn key(s: &str) -> ResourceKey {
        ResourceKey::from(s)
    }

    #[tokio::test]
    async fn add_deduplicates_queued_keys() {
        let q = WorkQueue::new();
        q.add(key("ns/pod-a")).await;
        q.add(key("ns/pod-a")).await;
        q.add(key("ns/pod-a")).await;
        assert_eq!(q.len().await, 1);
        assert_eq!(q.get().await, Some(key("ns/pod-a")));
        // Nothing else queued.
        assert!(timeout(Duration::from_millis(50), q.get()).await.is_err());
    }

    #[tokio::test]
    async fn in_flight_key_is_never_handed_out_twice() {
        let q = WorkQueue::new();
        q.add(key("ns/pod-b")).await;
        let held = q.get().await.unwrap();
        // Delete-style notification arrives while the key is in-flight.
        q.add(key("ns/pod-b")).await;
        assert!(
            timeout(Duration::from_millis(50), q.get()).await.is_err(),
            "key must not be processed concurrently with itself"
        );
        q.done(&held).await;
        // The dirty mark turns into an immediate re-add, not a drop.
        assert_eq!(q.get().await, Some(key("ns/pod-b")));
    }

    #[tokio::test]
    async fn done_without_redirty_clears_all_state() {
        let q = WorkQueue::new();
        q.add(key("ns/pod-a")).await;
        let k = q.get().await.unwrap();
        q.forget(&k).await;
        q.done(&k).await;
        assert_eq!(q.len().await, 0);
        assert_eq!(q.retries(&k).await, 0);
        assert!(timeout(Duration::from_millis(50), q.get()).await.is_err());
    }

    #[tokio::test]
    async fn unrelated_keys_process_concurrently() {
        let q = WorkQueue::new();
        q.add(key("ns/a")).await;
        q.add(key("ns/b")).await;
        let first = q.get().await.unwrap();
        let second = q.get().await.unwrap();
        assert_ne!(first, second);
        q.done(&first).await;
        q.done(&second).await;
    }

    #[test]
    fn backoff_is_monotonic_up_to_the_cap() {
        let limit = RateLimit { base_delay: Duration::from_millis(5), max_delay: Duration::from_secs(10) };
        let mut prev = Duration::ZERO;
        for n in 0..40 {
            let d = limit.delay_for(n);
            assert!(d >= prev, "delay for retry {n} regressed");
            assert!(d <= limit.max_delay);
            prev = d;
        }
        assert_eq!(limit.delay_for(39), limit.max_delay);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_key_is_not_eligible_before_its_delay() {
        let limit = RateLimit { base_delay: Duration::from_millis(100), max_delay: Duration::from_secs(10) };
        let q = WorkQueue::with_rate_limit(limit);
        q.add_rate_limited(key("ns/pod-c")).await;
        assert!(
            timeout(Duration::from_millis(99), q.get()).await.is_err(),
            "key became eligible before its backoff elapsed"
        );
        assert_eq!(q.get().await, Some(key("ns/pod-c")));
    }

    #[tokio::test(start_paused = true)]
    async fn third_failure_waits_for_the_third_interval() {
        let limit = RateLimit { base_delay: Duration::from_millis(100), max_delay: Duration::from_secs(10) };
        let q = WorkQueue::with_rate_limit(limit);
        // Fail the same key three times: delays 100ms, 200ms, 400ms.
        for expect in [100u64, 200, 400] {
            q.add_rate_limited(key("ns/pod-c")).await;
            assert!(
                timeout(Duration::from_millis(expect - 1), q.get()).await.is_err(),
                "requeue delivered before the {expect}ms backoff"
            );
            let k = q.get().await.unwrap();
            q.done(&k).await;
        }
        assert_eq!(q.retries(&key("ns/pod-c")).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn forget_resets_the_backoff_counter() {
        let limit = RateLimit { base_delay: Duration::from_millis(100), max_delay: Duration::from_secs(10) };
        let q = WorkQueue::with_rate_limit(limit);
        q.add_rate_limited(key("ns/x")).await;
        q.add_rate_limited(key("ns/x")).await;
        assert_eq!(q.retries(&key("ns/x")).await, 2);
        q.forget(&key("ns/x")).await;
        assert_eq!(q.retries(&key("ns/x")).await, 0);
        // Next failure starts over at the base delay.
        q.add_rate_limited(key("ns/x")).await;
        let k = timeout(Duration::from_millis(150), q.get()).await.expect("base delay again");
        assert_eq!(k, Some(key("ns/x")));
    }

    #[tokio::test]
    async fn shutdown_unblocks_a_waiting_consumer() {
        let q = Arc::new(WorkQueue::new());
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        // Let the consumer reach its blocking wait.
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.shut_down().await;
        let got = timeout(Duration::from_secs(1), waiter).await.expect("get did not unblock").unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn shutdown_drains_ready_keys_but_drops_scheduled_ones() {
        let q = WorkQueue::new();
        q.add(key("ns/ready")).await;
        q.add_rate_limited(key("ns/scheduled")).await;
        q.shut_down().await;
        assert_eq!(q.get().await, Some(key("ns/ready")));
        assert_eq!(q.get().await, None, "scheduled backoff entries are discarded on shutdown");
        // New work is refused once shut down.
        q.add(key("ns/late")).await;
        assert_eq!(q.get().await, None);
    }
}
