use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, warn};

/// An item that can be queued. Items sharing a key are never handed out
/// concurrently and a pending item is replaced by a newer one for its key.
pub trait QueueItem: Clone + Send + 'static {
    type Key: Clone + Eq + Hash + Display + Send + 'static;

    fn key(&self) -> Self::Key;
}

impl QueueItem for crate::state::Event {
    type Key = crate::state::WorkloadKey;

    fn key(&self) -> Self::Key {
        self.key.clone()
    }
}

/// Exponential per-key backoff with a bounded number of attempts.
#[derive(Debug, Clone)]
pub struct RateLimit {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total processing attempts, the first one included.
    pub max_attempts: u32,
}

impl RateLimit {
    /// Delay before the retry following the given number of failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

/// Failure history of a key. Retries carry the epoch they were scheduled in
/// and are discarded once the history has been cleared.
#[derive(Debug, Clone, Copy)]
struct Failures {
    count: u32,
    epoch: u64,
}

struct State<T: QueueItem> {
    order: VecDeque<T::Key>,
    pending: HashMap<T::Key, T>,
    processing: HashSet<T::Key>,
    failures: HashMap<T::Key, Failures>,
    next_epoch: u64,
}

struct Inner<T: QueueItem> {
    state: Mutex<State<T>>,
    notify: Notify,
    delayed: mpsc::UnboundedSender<(T, u64, Duration)>,
    shutdown: CancellationToken,
    limit: RateLimit,
}

/// A rate-limited work queue that coalesces items per key.
pub struct WorkQueue<T: QueueItem> {
    inner: Arc<Inner<T>>,
}

impl<T: QueueItem> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: QueueItem> WorkQueue<T> {
    /// Creates the queue and spawns its retry timer onto the current runtime.
    pub fn new(limit: RateLimit) -> Self {
        let (delayed, delayed_rx) = mpsc::unbounded_channel();
        let queue = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    order: VecDeque::new(),
                    pending: HashMap::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    next_epoch: 0,
                }),
                notify: Notify::new(),
                delayed,
                shutdown: CancellationToken::new(),
                limit,
            }),
        };
        tokio::spawn(run_retry_timer(
            Arc::downgrade(&queue.inner),
            queue.inner.shutdown.clone(),
            delayed_rx,
        ));
        queue
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues an item, replacing any item still pending for the same key.
    /// A fresh item starts with a full retry budget.
    pub fn add(&self, item: T) {
        self.lock().failures.remove(&item.key());
        self.enqueue(item, true);
    }

    fn enqueue(&self, item: T, replace: bool) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let key = item.key();
        let mut state = self.lock();
        if let Some(pending) = state.pending.get_mut(&key) {
            if replace {
                *pending = item;
            }
            return;
        }
        state.pending.insert(key.clone(), item);
        // Requeued by done() once the in-flight item for this key completes.
        if state.processing.contains(&key) {
            return;
        }
        state.order.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Waits for the next item. Returns `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                while let Some(key) = state.order.pop_front() {
                    if let Some(item) = state.pending.remove(&key) {
                        state.processing.insert(key);
                        return Some(item);
                    }
                }
                if self.inner.shutdown.is_cancelled() {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks the key as no longer in flight.
    pub fn done(&self, key: &T::Key) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.pending.contains_key(key) {
            state.order.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Clears the failure history of a key.
    pub fn forget(&self, key: &T::Key) {
        self.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &T::Key) -> u32 {
        self.lock().failures.get(key).map_or(0, |f| f.count)
    }

    /// Schedules the item again after its backoff delay.
    pub fn add_rate_limited(&self, item: T) {
        let (epoch, delay) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let failures = state.failures.entry(item.key()).or_insert_with(|| {
                state.next_epoch += 1;
                Failures {
                    count: 0,
                    epoch: state.next_epoch,
                }
            });
            failures.count += 1;
            (failures.epoch, self.inner.limit.backoff(failures.count))
        };
        debug!("Retrying {} in {:?}", item.key(), delay);
        if self.inner.delayed.send((item, epoch, delay)).is_err() {
            debug!("Retry timer stopped, dropping retry");
        }
    }

    /// Retries a failed item unless it has used up its attempts, in which
    /// case it is forgotten. Returns whether a retry was scheduled.
    pub fn retry_or_forget(&self, item: T, error: &dyn Display) -> bool {
        let key = item.key();
        let attempts = self.num_requeues(&key) + 1;
        if attempts < self.inner.limit.max_attempts {
            warn!(
                "Processing {} failed (attempt {}/{}), retrying: {}",
                key, attempts, self.inner.limit.max_attempts, error
            );
            self.add_rate_limited(item);
            true
        } else {
            warn!(
                "Dropping {} after {} failed attempts: {}",
                key, attempts, error
            );
            self.forget(&key);
            false
        }
    }

    fn enqueue_retry(&self, item: T, epoch: u64) {
        // A success or a newer item since the failure cleared the history.
        let current = self.lock().failures.get(&item.key()).map(|f| f.epoch);
        if current != Some(epoch) {
            debug!("Discarding superseded retry for {}", item.key());
            return;
        }
        self.enqueue(item, false);
    }

    /// Stops accepting items. Waiting `get()` calls return once the queue drains.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }
}

/// Runs until the queue shuts down or its last handle is dropped.
async fn run_retry_timer<T: QueueItem>(
    inner: Weak<Inner<T>>,
    shutdown: CancellationToken,
    mut delayed_rx: mpsc::UnboundedReceiver<(T, u64, Duration)>,
) {
    let mut timers = DelayQueue::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = delayed_rx.recv() => match received {
                Some((item, epoch, delay)) => {
                    timers.insert((item, epoch), delay);
                }
                None => break,
            },
            Some(expired) = timers.next(), if !timers.is_empty() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let (item, epoch) = expired.into_inner();
                WorkQueue { inner }.enqueue_retry(item, epoch);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Action, Event, WorkloadKey};

    fn limit() -> RateLimit {
        RateLimit {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            max_attempts: 5,
        }
    }

    fn event(name: &str, action: Action) -> Event {
        Event::new(WorkloadKey::new("Deployment", "default", name), action)
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let limit = RateLimit {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(30),
            max_attempts: 5,
        };
        assert_eq!(limit.backoff(1), Duration::from_millis(5));
        assert_eq!(limit.backoff(2), Duration::from_millis(10));
        assert_eq!(limit.backoff(3), Duration::from_millis(20));
        assert_eq!(limit.backoff(4), Duration::from_millis(30));
        assert_eq!(limit.backoff(40), Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_pending_items_are_coalesced_per_key() {
        let queue = WorkQueue::new(limit());
        queue.add(event("a", Action::Created));
        queue.add(event("a", Action::Updated));
        queue.add(event("b", Action::Created));
        assert_eq!(queue.len(), 2);

        let first = queue.get().await.expect("item");
        assert_eq!(first, event("a", Action::Updated));
        let second = queue.get().await.expect("item");
        assert_eq!(second, event("b", Action::Created));
    }

    #[tokio::test]
    async fn test_key_is_held_back_while_processing() {
        let queue = WorkQueue::new(limit());
        queue.add(event("a", Action::Created));
        let item = queue.get().await.expect("item");

        queue.add(event("a", Action::Deleted));
        assert_eq!(queue.len(), 0);

        queue.done(&item.key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(event("a", Action::Deleted)));
    }

    #[tokio::test]
    async fn test_get_wakes_up_on_add() {
        let queue = WorkQueue::new(limit());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.add(event("a", Action::Created));
        let received = waiter.await.expect("task");
        assert_eq!(received, Some(event("a", Action::Created)));
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_get() {
        let queue: WorkQueue<Event> = WorkQueue::new(limit());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown();
        assert_eq!(waiter.await.expect("task"), None);

        queue.add(event("a", Action::Created));
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_item_is_dropped_after_max_attempts() {
        let queue = WorkQueue::new(limit());
        queue.add(event("a", Action::Created));

        let mut attempts = 0;
        loop {
            let item = queue.get().await.expect("item");
            attempts += 1;
            let retried = queue.retry_or_forget(item.clone(), &"boom");
            queue.done(&item.key);
            if !retried {
                break;
            }
        }

        assert_eq!(attempts, 5);
        assert_eq!(queue.num_requeues(&event("a", Action::Created).key), 0);
        let sixth = tokio::time::timeout(Duration::from_secs(3600), queue.get()).await;
        assert!(sixth.is_err(), "item was retried a sixth time");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_does_not_overwrite_newer_event() {
        let queue = WorkQueue::new(limit());
        queue.add(event("a", Action::Created));
        let item = queue.get().await.expect("item");
        assert!(queue.retry_or_forget(item.clone(), &"not in cache"));
        queue.done(&item.key);

        queue.add(event("a", Action::Deleted));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(event("a", Action::Deleted)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_is_discarded_after_success() {
        let queue = WorkQueue::new(limit());
        queue.add(event("a", Action::Created));
        let item = queue.get().await.expect("item");
        assert!(queue.retry_or_forget(item.clone(), &"not in cache"));
        queue.done(&item.key);

        queue.add(event("a", Action::Deleted));
        let deleted = queue.get().await.expect("item");
        queue.forget(&deleted.key);
        queue.done(&deleted.key);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_event_gets_a_full_retry_budget() {
        let queue = WorkQueue::new(limit());
        queue.add(event("a", Action::Created));
        for _ in 0..4 {
            let item = queue.get().await.expect("item");
            assert!(queue.retry_or_forget(item.clone(), &"not in cache"));
            queue.done(&item.key);
        }
        assert_eq!(queue.num_requeues(&event("a", Action::Created).key), 4);

        queue.add(event("a", Action::Updated));
        assert_eq!(queue.num_requeues(&event("a", Action::Updated).key), 0);

        let mut attempts = 0;
        loop {
            let item = queue.get().await.expect("item");
            assert_eq!(item, event("a", Action::Updated));
            attempts += 1;
            let retried = queue.retry_or_forget(item.clone(), &"boom");
            queue.done(&item.key);
            if !retried {
                break;
            }
        }
        assert_eq!(attempts, 5);
    }

    #[tokio::test]
    async fn test_retry_timer_does_not_keep_queue_alive() {
        let queue: WorkQueue<Event> = WorkQueue::new(limit());
        let inner = Arc::downgrade(&queue.inner);
        tokio::task::yield_now().await;

        drop(queue);
        tokio::task::yield_now().await;
        assert_eq!(inner.strong_count(), 0);
    }
}
