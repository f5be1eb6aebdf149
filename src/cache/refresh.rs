//! Background refresh queue.
//!
//! A FIFO set of keys waiting to be re-fetched. Scheduling a key that is
//! already pending is a no-op, so a hot stale entry read many times produces
//! one origin request. The queue is drained serially by the cache manager's
//! refresh worker; see [`crate::cache::manager::RefreshWorker`].

use std::collections::{HashMap, VecDeque};

use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::cache::policy::CacheKey;
use crate::fetch::SharedFetcher;

/// A pending refresh: the key and the fetcher that repopulates it.
pub struct RefreshJob<T> {
    pub key: CacheKey,
    pub fetcher: SharedFetcher<T>,
}

struct QueueState<T> {
    order: VecDeque<CacheKey>,
    fetchers: HashMap<CacheKey, SharedFetcher<T>>,
    stats: RefreshStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub total_scheduled: u64,
    pub total_deduplicated: u64,
    pub total_dequeued: u64,
}

pub struct RefreshQueue<T> {
    state: Mutex<QueueState<T>>,
    wake: Notify,
}

impl<T> Default for RefreshQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RefreshQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                order: VecDeque::new(),
                fetchers: HashMap::new(),
                stats: RefreshStats::default(),
            }),
            wake: Notify::new(),
        }
    }

    /// Queue `key` for refresh. Returns `false` if it was already pending.
    pub async fn schedule(&self, key: CacheKey, fetcher: SharedFetcher<T>) -> bool {
        let mut state = self.state.lock().await;
        if state.fetchers.contains_key(&key) {
            state.stats.total_deduplicated += 1;
            return false;
        }

        debug!(key = %key, pending = state.order.len() + 1, "Scheduled refresh");
        state.order.push_back(key.clone());
        state.fetchers.insert(key, fetcher);
        state.stats.total_scheduled += 1;
        drop(state);

        self.wake.notify_one();
        true
    }

    /// Take the oldest pending job.
    pub async fn pop(&self) -> Option<RefreshJob<T>> {
        let mut state = self.state.lock().await;
        while let Some(key) = state.order.pop_front() {
            if let Some(fetcher) = state.fetchers.remove(&key) {
                state.stats.total_dequeued += 1;
                return Some(RefreshJob { key, fetcher });
            }
        }
        None
    }

    /// Drop a pending refresh, e.g. because the key was invalidated.
    pub async fn cancel(&self, key: &CacheKey) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.fetchers.remove(key).is_some();
        if removed {
            state.order.retain(|k| k != key);
        }
        removed
    }

    /// Drop every pending refresh. Returns how many were dropped.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let n = state.fetchers.len();
        state.order.clear();
        state.fetchers.clear();
        n
    }

    pub async fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().await.fetchers.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.fetchers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Pending keys in queue order.
    pub async fn pending(&self) -> Vec<CacheKey> {
        self.state.lock().await.order.iter().cloned().collect()
    }

    pub async fn stats(&self) -> RefreshStats {
        self.state.lock().await.stats
    }

    /// Wait until something is scheduled. A schedule that happened while no
    /// one was waiting is not lost.
    pub async fn notified(&self) {
        self.wake.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::policy::PolicyTag;
    use crate::fetch::{fetcher_fn, Fetched};

    fn fetcher() -> SharedFetcher<u32> {
        fetcher_fn(|| async { Ok(Fetched::new(1u32)) })
    }

    fn key(k: &str) -> CacheKey {
        CacheKey::new(PolicyTag::Videos, k)
    }

    #[tokio::test]
    async fn test_reenqueue_is_noop() {
        let queue = RefreshQueue::new();
        assert!(queue.schedule(key("a"), fetcher()).await);
        assert!(!queue.schedule(key("a"), fetcher()).await);
        assert_eq!(queue.len().await, 1);

        let stats = queue.stats().await;
        assert_eq!(stats.total_scheduled, 1);
        assert_eq!(stats.total_deduplicated, 1);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = RefreshQueue::new();
        for k in ["a", "b", "c"] {
            queue.schedule(key(k), fetcher()).await;
        }
        assert_eq!(queue.pop().await.unwrap().key, key("a"));
        assert_eq!(queue.pop().await.unwrap().key, key("b"));
        // Once popped, a key may be scheduled again.
        assert!(queue.schedule(key("a"), fetcher()).await);
        assert_eq!(queue.pop().await.unwrap().key, key("c"));
        assert_eq!(queue.pop().await.unwrap().key, key("a"));
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel() {
        let queue = RefreshQueue::new();
        queue.schedule(key("a"), fetcher()).await;
        queue.schedule(key("b"), fetcher()).await;
        assert!(queue.cancel(&key("a")).await);
        assert!(!queue.cancel(&key("a")).await);
        assert_eq!(queue.pending().await, vec![key("b")]);
    }
}
