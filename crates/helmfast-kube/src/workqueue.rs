//! Keyed workqueue with rate-limited requeue
//!
//! Semantics follow the classic controller workqueue: a key is queued at
//! most once, a key being processed is not handed to a second worker, and a
//! key re-added while in flight is marked dirty and requeued when its worker
//! calls `done`. Failed keys come back through per-key rate limiters.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Per-key requeue delay policy
pub trait RateLimiter<K>: Send {
    /// Record a failure for the key and return the delay before its retry
    fn next_delay(&mut self, key: &K) -> Duration;

    /// Clear the failure history for the key
    fn forget(&mut self, key: &K);
}

/// Exponential per-item backoff: base * 2^failures, capped at max
pub struct ExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: HashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> ExponentialBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for ExponentialBackoff<K> {
    fn next_delay(&mut self, key: &K) -> Duration {
        let failures = self.failures.entry(key.clone()).or_insert(0);
        let exponent = (*failures).min(32);
        *failures += 1;
        let delay = self
            .base
            .checked_mul(1u32 << exponent.min(31))
            .unwrap_or(self.max);
        delay.min(self.max)
    }

    fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }
}

/// Fast retries for the first `max_fast` failures, slow ones after
pub struct FastSlow<K> {
    fast: Duration,
    slow: Duration,
    max_fast: u32,
    failures: HashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> FastSlow<K> {
    pub fn new(fast: Duration, slow: Duration, max_fast: u32) -> Self {
        Self {
            fast,
            slow,
            max_fast,
            failures: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for FastSlow<K> {
    fn next_delay(&mut self, key: &K) -> Duration {
        let failures = self.failures.entry(key.clone()).or_insert(0);
        *failures += 1;
        if *failures <= self.max_fast {
            self.fast
        } else {
            self.slow
        }
    }

    fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }
}

/// Envelope of two limiters: both record the failure, the longer delay wins
pub struct MaxOf<A, B>(pub A, pub B);

impl<K, A: RateLimiter<K>, B: RateLimiter<K>> RateLimiter<K> for MaxOf<A, B> {
    fn next_delay(&mut self, key: &K) -> Duration {
        self.0.next_delay(key).max(self.1.next_delay(key))
    }

    fn forget(&mut self, key: &K) {
        self.0.forget(key);
        self.1.forget(key);
    }
}

/// The reconciler's default policy: exponential 5ms -> 30s combined with a
/// 1ms fast / 2min slow schedule that flips after 30 fast attempts.
pub fn default_rate_limiter<K: Eq + Hash + Clone + Send + 'static>() -> impl RateLimiter<K> {
    MaxOf(
        FastSlow::new(Duration::from_millis(1), Duration::from_secs(120), 30),
        ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(30)),
    )
}

struct QueueState<K> {
    queue: VecDeque<K>,
    queued: HashSet<K>,
    active: HashSet<K>,
    dirty: HashSet<K>,
    limiter: Box<dyn RateLimiter<K>>,
    shutting_down: bool,
}

/// Keyed FIFO queue drained by a worker pool
pub struct Workqueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K: Eq + Hash + Clone + Send + 'static> Workqueue<K> {
    pub fn new(limiter: impl RateLimiter<K> + 'static) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                active: HashSet::new(),
                dirty: HashSet::new(),
                limiter: Box::new(limiter),
                shutting_down: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Queue a key. Keys already queued are not duplicated; keys in flight
    /// are marked dirty and requeued when their worker finishes.
    pub fn add(&self, key: K) {
        {
            let mut state = self.state.lock().expect("workqueue poisoned");
            if state.shutting_down {
                return;
            }
            if state.active.contains(&key) {
                state.dirty.insert(key);
                return;
            }
            if !state.queued.insert(key.clone()) {
                return;
            }
            state.queue.push_back(key);
        }
        self.notify.notify_waiters();
    }

    /// Queue a key after a delay
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Queue a key after its rate-limited delay, recording a failure
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = {
            let mut state = self.state.lock().expect("workqueue poisoned");
            state.limiter.next_delay(&key)
        };
        self.add_after(key, delay);
    }

    /// Clear the rate-limit history for a key after a successful reconcile
    pub fn forget(&self, key: &K) {
        let mut state = self.state.lock().expect("workqueue poisoned");
        state.limiter.forget(key);
    }

    /// Take the next key, waiting until one is available. Returns `None`
    /// once the queue is shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            {
                let mut state = self.state.lock().expect("workqueue poisoned");
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            // notified() can miss a wakeup between the check and the await;
            // the timeout bounds that window instead of complicating the lock
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }

    /// Mark a key's processing finished, requeueing it if it went dirty
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.state.lock().expect("workqueue poisoned");
            state.active.remove(key);
            if state.dirty.remove(key) && !state.shutting_down && state.queued.insert(key.clone())
            {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_waiters();
        }
    }

    /// Stop accepting keys; `get` returns `None` once drained
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock().expect("workqueue poisoned");
            state.shutting_down = true;
        }
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().expect("workqueue poisoned").queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let mut limiter: ExponentialBackoff<&str> =
            ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(30));

        assert_eq!(limiter.next_delay(&"k"), Duration::from_millis(5));
        assert_eq!(limiter.next_delay(&"k"), Duration::from_millis(10));
        assert_eq!(limiter.next_delay(&"k"), Duration::from_millis(20));

        for _ in 0..20 {
            limiter.next_delay(&"k");
        }
        assert_eq!(limiter.next_delay(&"k"), Duration::from_secs(30));

        limiter.forget(&"k");
        assert_eq!(limiter.next_delay(&"k"), Duration::from_millis(5));
    }

    #[test]
    fn test_exponential_backoff_is_per_key() {
        let mut limiter: ExponentialBackoff<&str> =
            ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(30));
        limiter.next_delay(&"a");
        limiter.next_delay(&"a");
        assert_eq!(limiter.next_delay(&"b"), Duration::from_millis(5));
    }

    #[test]
    fn test_fast_slow_flips_after_max_fast() {
        let mut limiter: FastSlow<&str> =
            FastSlow::new(Duration::from_millis(1), Duration::from_secs(120), 3);

        for _ in 0..3 {
            assert_eq!(limiter.next_delay(&"k"), Duration::from_millis(1));
        }
        assert_eq!(limiter.next_delay(&"k"), Duration::from_secs(120));

        limiter.forget(&"k");
        assert_eq!(limiter.next_delay(&"k"), Duration::from_millis(1));
    }

    #[test]
    fn test_max_of_takes_envelope() {
        let mut limiter = MaxOf(
            FastSlow::<&str>::new(Duration::from_millis(1), Duration::from_secs(120), 2),
            ExponentialBackoff::<&str>::new(Duration::from_millis(5), Duration::from_secs(30)),
        );

        // early: exponential dominates the 1ms fast lane
        assert_eq!(limiter.next_delay(&"k"), Duration::from_millis(5));
        assert_eq!(limiter.next_delay(&"k"), Duration::from_millis(10));
        // past max_fast: the 2min slow lane dominates the capped exponential
        assert_eq!(limiter.next_delay(&"k"), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_queue_dedups_pending_keys() {
        let queue = Workqueue::new(default_rate_limiter::<String>());
        queue.add("a".to_string());
        queue.add("a".to_string());
        queue.add("b".to_string());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await, Some("a".to_string()));
        assert_eq!(queue.get().await, Some("b".to_string()));
    }

    #[tokio::test]
    async fn test_in_flight_key_goes_dirty_and_requeues() {
        let queue = Workqueue::new(default_rate_limiter::<String>());
        queue.add("a".to_string());
        let key = queue.get().await.unwrap();

        // re-added while in flight: not queued yet
        queue.add("a".to_string());
        assert_eq!(queue.len(), 0);

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_ends() {
        let queue = Workqueue::new(default_rate_limiter::<String>());
        queue.add("a".to_string());
        queue.shutdown();

        assert_eq!(queue.get().await, Some("a".to_string()));
        assert_eq!(queue.get().await, None);

        // adds after shutdown are ignored
        queue.add("b".to_string());
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_add_after_delivers_later() {
        tokio::time::pause();
        let queue = Workqueue::new(default_rate_limiter::<String>());
        queue.add_after("a".to_string(), Duration::from_secs(5));
        assert_eq!(queue.len(), 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(queue.get().await, Some("a".to_string()));
    }
}
