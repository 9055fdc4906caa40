//! Deduplicating, rate-limited work queue
//!
//! Items are unique while waiting: adding an item that is already queued is a
//! no-op. An item that is being processed is never handed out again until the
//! worker calls [`WorkQueue::done`]; adds that arrive meanwhile mark it dirty
//! and it is queued once more at `done`. Rate-limited adds of one item share
//! a single pending timer that fires at the earliest requested time.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::pin::pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::retry::{ExponentialBackoff, RateLimiter};

struct State<T> {
    queue: VecDeque<T>,
    /// Items that need processing, queued or not
    dirty: HashSet<T>,
    /// Items currently held by a worker
    processing: HashSet<T>,
    /// Ready time of the pending delayed add for each item
    waiting: HashMap<T, Instant>,
    shutting_down: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<T>>,
    /// Cancels pending delayed adds on shutdown
    shutdown: CancellationToken,
}

/// Shared handle to a work queue
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(ExponentialBackoff::default())
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    waiting: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                limiter: Box::new(limiter),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Mark `item` as needing processing
    pub fn add(&self, item: T) {
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down || state.dirty.contains(&item) {
                return;
            }
            state.dirty.insert(item.clone());
            if state.processing.contains(&item) {
                return;
            }
            state.queue.push_back(item);
        }
        self.inner.notify.notify_one();
    }

    /// Wait for the next item. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let mut notified = pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Release `item` after processing; re-queue it if it was added meanwhile
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut state = self.inner.state.lock();
            state.processing.remove(item);
            if state.dirty.contains(item) && !state.shutting_down {
                state.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Add `item` after its backoff delay elapses.
    ///
    /// An item already waiting keeps the earlier of its current and new ready
    /// times, so repeated failures never stack up timers.
    pub fn add_rate_limited(&self, item: T) {
        let ready_at = Instant::now() + self.inner.limiter.when(&item);
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            if state.waiting.get(&item).is_some_and(|pending| *pending <= ready_at) {
                return;
            }
            state.waiting.insert(item.clone(), ready_at);
        }

        let queue = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep_until(ready_at) => queue.fire(item, ready_at),
            }
        });
    }

    /// Timer for `item` elapsed; add it unless an earlier timer replaced this one
    fn fire(&self, item: T, ready_at: Instant) {
        {
            let mut state = self.inner.state.lock();
            if state.waiting.get(&item) != Some(&ready_at) {
                return;
            }
            state.waiting.remove(&item);
        }
        self.add(item);
    }

    /// Reset backoff for `item`
    pub fn forget(&self, item: &T) {
        self.inner.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner.limiter.num_requeues(item)
    }

    /// Items waiting to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out items. Blocked and future `get` calls return `None`.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
        }
        debug!("Work queue shutting down");
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn queue() -> WorkQueue<String> {
        WorkQueue::default()
    }

    #[tokio::test]
    async fn test_add_deduplicates() {
        let q = queue();
        q.add("ns1/web".to_string());
        q.add("ns1/web".to_string());
        q.add("ns1/db".to_string());
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.as_deref(), Some("ns1/web"));
        assert_eq!(q.get().await.as_deref(), Some("ns1/db"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_item_not_handed_out_while_processing() {
        let q = queue();
        let key = "ns1/web".to_string();
        q.add(key.clone());
        let item = q.get().await.unwrap();

        // Two adds while processing collapse into one pending run
        q.add(key.clone());
        q.add(key.clone());
        assert_eq!(q.len(), 0);
        assert!(timeout(Duration::from_millis(50), q.get()).await.is_err());

        q.done(&item);
        assert_eq!(q.len(), 1);
        let again = q.get().await.unwrap();
        q.done(&again);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_done_without_readd_drops_item() {
        let q = queue();
        q.add("a".to_string());
        let item = q.get().await.unwrap();
        q.done(&item);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_wakes_blocked_getters() {
        let q = queue();
        let getters: Vec<_> = (0..3)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.get().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.shutdown();

        for getter in getters {
            let result = timeout(Duration::from_secs(1), getter).await.unwrap();
            assert!(result.unwrap().is_none());
        }
        q.add("late".to_string());
        assert!(q.get().await.is_none());
    }

    #[tokio::test]
    async fn test_blocked_get_receives_new_item() {
        let q = queue();
        let getter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.add("ns1/web".to_string());

        let got = timeout(Duration::from_secs(1), getter).await.unwrap().unwrap();
        assert_eq!(got.as_deref(), Some("ns1/web"));
    }

    #[tokio::test]
    async fn test_add_rate_limited_delays_and_counts() {
        let q = queue();
        let key = "ns1/web".to_string();

        q.add_rate_limited(key.clone());
        assert_eq!(q.num_requeues(&key), 1);

        let got = timeout(Duration::from_secs(1), q.get()).await.unwrap();
        assert_eq!(got.as_deref(), Some("ns1/web"));

        q.forget(&key);
        assert_eq!(q.num_requeues(&key), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drops_pending_rate_limited_adds() {
        let q: WorkQueue<String> = WorkQueue::new(ExponentialBackoff::new(
            Duration::from_millis(50),
            Duration::from_secs(1),
        ));
        q.add_rate_limited("a".to_string());
        q.shutdown();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(q.is_empty());
    }

    /// Hands out a fixed series of delays
    struct FixedDelays(Mutex<VecDeque<Duration>>);

    impl FixedDelays {
        fn new(delays: &[u64]) -> Self {
            Self(Mutex::new(
                delays.iter().map(|ms| Duration::from_millis(*ms)).collect(),
            ))
        }
    }

    impl RateLimiter<String> for FixedDelays {
        fn when(&self, _item: &String) -> Duration {
            self.0.lock().pop_front().unwrap_or_default()
        }

        fn forget(&self, _item: &String) {}

        fn num_requeues(&self, _item: &String) -> u32 {
            0
        }
    }

    #[tokio::test]
    async fn test_repeated_rate_limited_adds_deliver_once() {
        let q = WorkQueue::new(FixedDelays::new(&[20, 200, 300]));
        let key = "ns1/web".to_string();
        q.add_rate_limited(key.clone());
        q.add_rate_limited(key.clone());
        q.add_rate_limited(key.clone());

        let item = timeout(Duration::from_millis(150), q.get())
            .await
            .unwrap()
            .unwrap();
        q.done(&item);

        // Later timers were never started, so nothing else arrives
        assert!(timeout(Duration::from_millis(400), q.get()).await.is_err());
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_earlier_rate_limited_add_wins() {
        let q = WorkQueue::new(FixedDelays::new(&[300, 20]));
        let key = "ns1/web".to_string();
        q.add_rate_limited(key.clone());
        q.add_rate_limited(key.clone());

        let item = timeout(Duration::from_millis(150), q.get())
            .await
            .unwrap()
            .unwrap();
        q.done(&item);

        // The superseded 300ms timer does not add the key again
        assert!(timeout(Duration::from_millis(400), q.get()).await.is_err());
    }

    #[tokio::test]
    async fn test_key_can_wait_again_after_delivery() {
        let q = WorkQueue::new(FixedDelays::new(&[10, 10]));
        let key = "ns1/web".to_string();

        q.add_rate_limited(key.clone());
        let first = timeout(Duration::from_secs(1), q.get()).await.unwrap().unwrap();
        q.done(&first);

        q.add_rate_limited(key.clone());
        let second = timeout(Duration::from_secs(1), q.get()).await.unwrap().unwrap();
        assert_eq!(second, key);
    }
}
