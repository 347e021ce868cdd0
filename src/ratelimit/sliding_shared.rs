//! Sliding-window rate limiters over a shared store (redis).
//!
//! The per-caller log lives in the store, so every process pointing at it
//! enforces one budget. Each decision is several round trips that are not
//! executed as one transaction: concurrent calls for the same caller can
//! interleave between the check and the write and overshoot the threshold by
//! the number of calls in flight. Calls for different callers never interact.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::limiter::{now_millis, LimitConfig, RateLimiter};
use crate::error::Result;
use crate::store::{caller_key, ListStore, SortedSetStore};

/// Orders sorted-set members that share a score by arrival within this
/// process.
static MEMBER_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Sorted-set member for an action. Members with equal scores sort by their
/// bytes, so the zero-padded sequence keeps same-millisecond actions in
/// arrival order and the uuid keeps members from other processes distinct.
fn sorted_set_member() -> String {
    let seq = MEMBER_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{:020}-{}", seq, Uuid::new_v4().simple())
}

/// Sliding window over a shared list per caller.
///
/// Prunes by peeking at the head (`LRANGE 0 0`) and popping while stale, then
/// compares `LLEN` with the threshold and appends on success.
pub struct SlidingWindowSharedList<S: ListStore + 'static> {
    limits: LimitConfig,
    store: Arc<S>,
    key_prefix: String,
    destroyed: AtomicBool,
}

impl<S: ListStore + 'static> SlidingWindowSharedList<S> {
    pub const NAME: &'static str = "sliding-window-redis-list";

    pub fn new(limits: LimitConfig, store: Arc<S>, key_prefix: impl Into<String>) -> Result<Self> {
        limits.validate()?;
        info!(
            limiter = Self::NAME,
            threshold = limits.threshold,
            time_interval_ms = limits.time_interval_ms,
            "Rate limiter initialized"
        );
        Ok(Self {
            limits,
            store,
            key_prefix: key_prefix.into(),
            destroyed: AtomicBool::new(false),
        })
    }

    pub(crate) async fn decide_at(&self, caller_id: &str, now: i64) -> Result<bool> {
        let key = caller_key(&self.key_prefix, caller_id);
        let window_start = self.limits.window_start(now);

        loop {
            let head = self.store.lrange(&key, 0, 0).await?;
            let Some(oldest) = head.first() else {
                break;
            };
            match oldest.parse::<i64>() {
                Ok(timestamp) if timestamp >= window_start => break,
                Ok(_) => {}
                Err(_) => warn!(key = %key, entry = %oldest, "Dropping malformed timestamp"),
            }
            self.store.lpop(&key).await?;
        }

        let in_window = self.store.llen(&key).await?;
        if in_window as u64 >= self.limits.threshold {
            debug!(limiter = Self::NAME, caller = %caller_id, in_window = in_window, "Rate limit exceeded");
            return Ok(false);
        }

        self.store.rpush(&key, &now.to_string()).await?;
        self.store.expire(&key, self.limits.time_interval_ms).await?;
        trace!(limiter = Self::NAME, caller = %caller_id, in_window = in_window + 1, "Action allowed");
        Ok(true)
    }
}

#[async_trait]
impl<S: ListStore + 'static> RateLimiter for SlidingWindowSharedList<S> {
    async fn is_allowed(&self, caller_id: &str) -> Result<bool> {
        self.decide_at(caller_id, now_millis()).await
    }

    fn threshold(&self) -> u64 {
        self.limits.threshold
    }

    fn time_interval(&self) -> u64 {
        self.limits.time_interval_ms
    }

    async fn reset(&self) -> Result<()> {
        self.store.delete_prefix(&format!("{}:", self.key_prefix)).await?;
        debug!(limiter = Self::NAME, prefix = %self.key_prefix, "Rate limiter reset");
        Ok(())
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.store.close().await {
            warn!(limiter = Self::NAME, error = %e, "Failed to close store connection");
        }
        info!(limiter = Self::NAME, "Rate limiter destroyed");
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }
}

/// Sliding window over a shared sorted set per caller, scored by timestamp.
///
/// Adds the new action first, trims everything older than the window, then
/// uses the entry's rank as the count of actions in the window. The rank
/// lookup is `O(log n)` in the store instead of a scan. A denied entry is
/// removed again so only allowed actions stay in the log.
pub struct SlidingWindowSortedSet<S: SortedSetStore + 'static> {
    limits: LimitConfig,
    store: Arc<S>,
    key_prefix: String,
    destroyed: AtomicBool,
}

impl<S: SortedSetStore + 'static> SlidingWindowSortedSet<S> {
    pub const NAME: &'static str = "sliding-window-redis-sorted-set";

    pub fn new(limits: LimitConfig, store: Arc<S>, key_prefix: impl Into<String>) -> Result<Self> {
        limits.validate()?;
        info!(
            limiter = Self::NAME,
            threshold = limits.threshold,
            time_interval_ms = limits.time_interval_ms,
            "Rate limiter initialized"
        );
        Ok(Self {
            limits,
            store,
            key_prefix: key_prefix.into(),
            destroyed: AtomicBool::new(false),
        })
    }

    pub(crate) async fn decide_at(&self, caller_id: &str, now: i64) -> Result<bool> {
        let key = caller_key(&self.key_prefix, caller_id);
        let member = sorted_set_member();

        self.store.zadd(&key, &member, now).await?;
        self.store
            .zrem_range_by_score(&key, i64::MIN, self.limits.window_start(now))
            .await?;
        let rank = self.store.zrank(&key, &member).await?;

        match rank {
            Some(rank) if rank as u64 + 1 > self.limits.threshold => {
                self.store.zrem(&key, &member).await?;
                debug!(limiter = Self::NAME, caller = %caller_id, rank = rank, "Rate limit exceeded");
                Ok(false)
            }
            _ => {
                self.store.expire(&key, self.limits.time_interval_ms).await?;
                trace!(limiter = Self::NAME, caller = %caller_id, rank = ?rank, "Action allowed");
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl<S: SortedSetStore + 'static> RateLimiter for SlidingWindowSortedSet<S> {
    async fn is_allowed(&self, caller_id: &str) -> Result<bool> {
        self.decide_at(caller_id, now_millis()).await
    }

    fn threshold(&self) -> u64 {
        self.limits.threshold
    }

    fn time_interval(&self) -> u64 {
        self.limits.time_interval_ms
    }

    async fn reset(&self) -> Result<()> {
        self.store.delete_prefix(&format!("{}:", self.key_prefix)).await?;
        debug!(limiter = Self::NAME, prefix = %self.key_prefix, "Rate limiter reset");
        Ok(())
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.store.close().await {
            warn!(limiter = Self::NAME, error = %e, "Failed to close store connection");
        }
        info!(limiter = Self::NAME, "Rate limiter destroyed");
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn limits(threshold: u64, time_interval_ms: u64) -> LimitConfig {
        LimitConfig::new(threshold, time_interval_ms).unwrap()
    }

    fn shared_limiters(
        store: &Arc<MemoryStore>,
        threshold: u64,
        time_interval_ms: u64,
    ) -> Vec<Arc<dyn RateLimiter>> {
        let list: Arc<dyn RateLimiter> = Arc::new(
            SlidingWindowSharedList::new(limits(threshold, time_interval_ms), store.clone(), "list")
                .unwrap(),
        );
        let sorted: Arc<dyn RateLimiter> = Arc::new(
            SlidingWindowSortedSet::new(limits(threshold, time_interval_ms), store.clone(), "zset")
                .unwrap(),
        );
        vec![list, sorted]
    }

    #[tokio::test]
    async fn test_threshold_enforced() {
        let store = Arc::new(MemoryStore::new());
        for limiter in shared_limiters(&store, 4, 60_000) {
            for _ in 0..4 {
                assert!(limiter.is_allowed("user").await.unwrap(), "{}", limiter.name());
            }
            assert!(!limiter.is_allowed("user").await.unwrap(), "{}", limiter.name());
        }
    }

    #[tokio::test]
    async fn test_callers_are_isolated() {
        let store = Arc::new(MemoryStore::new());
        for limiter in shared_limiters(&store, 1, 60_000) {
            assert!(limiter.is_allowed("a").await.unwrap());
            assert!(!limiter.is_allowed("a").await.unwrap());
            assert!(limiter.is_allowed("b").await.unwrap(), "{}", limiter.name());
        }
    }

    #[tokio::test]
    async fn test_window_recovery() {
        let store = Arc::new(MemoryStore::new());
        let limiters = shared_limiters(&store, 2, 150);
        for limiter in &limiters {
            assert!(limiter.is_allowed("user").await.unwrap());
            assert!(limiter.is_allowed("user").await.unwrap());
            assert!(!limiter.is_allowed("user").await.unwrap());
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        for limiter in &limiters {
            assert!(limiter.is_allowed("user").await.unwrap(), "{}", limiter.name());
        }
    }

    #[tokio::test]
    async fn test_denies_burst_across_boundary() {
        let store = Arc::new(MemoryStore::new());
        let limiters = shared_limiters(&store, 4, 1000);
        for limiter in &limiters {
            limiter.reset().await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(900)).await;
        for limiter in &limiters {
            for _ in 0..4 {
                assert!(limiter.is_allowed("user").await.unwrap());
            }
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        for limiter in &limiters {
            assert!(!limiter.is_allowed("user").await.unwrap(), "{}", limiter.name());
        }
    }

    #[tokio::test]
    async fn test_list_prunes_stale_head() {
        let store = Arc::new(MemoryStore::new());
        let limiter = SlidingWindowSharedList::new(limits(2, 1000), store.clone(), "list").unwrap();

        assert!(limiter.decide_at("user", 10_000).await.unwrap());
        assert!(limiter.decide_at("user", 10_500).await.unwrap());
        assert!(!limiter.decide_at("user", 11_000).await.unwrap());
        assert!(limiter.decide_at("user", 11_001).await.unwrap());

        let log = store.lrange("list:user", 0, -1).await.unwrap();
        assert_eq!(log, vec!["10500".to_string(), "11001".to_string()]);
    }

    #[tokio::test]
    async fn test_list_drops_malformed_entries() {
        let store = Arc::new(MemoryStore::new());
        store.rpush("list:user", "garbage").await.unwrap();
        let limiter = SlidingWindowSharedList::new(limits(1, 1000), store.clone(), "list").unwrap();

        assert!(limiter.decide_at("user", 10_000).await.unwrap());
        assert_eq!(store.llen("list:user").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sorted_set_denied_entry_is_removed() {
        let store = Arc::new(MemoryStore::new());
        let limiter = SlidingWindowSortedSet::new(limits(1, 1000), store.clone(), "zset").unwrap();

        assert!(limiter.decide_at("user", 10_000).await.unwrap());
        for now in [10_100, 10_200, 10_300] {
            assert!(!limiter.decide_at("user", now).await.unwrap());
        }

        // Only the allowed action is left, so the caller recovers one window
        // after it rather than after the last denied attempt
        assert!(limiter.decide_at("user", 11_001).await.unwrap());
    }

    #[tokio::test]
    async fn test_sorted_set_same_millisecond_actions_respect_threshold() {
        for _ in 0..200 {
            let store = Arc::new(MemoryStore::new());
            let limiter = SlidingWindowSortedSet::new(limits(2, 1000), store, "zset").unwrap();

            let mut allowed = 0;
            for _ in 0..5 {
                if limiter.decide_at("user", 10_000).await.unwrap() {
                    allowed += 1;
                }
            }
            assert_eq!(allowed, 2);
        }
    }

    #[test]
    fn test_sorted_set_members_sort_in_arrival_order() {
        let members: Vec<String> = (0..50).map(|_| sorted_set_member()).collect();
        let mut sorted = members.clone();
        sorted.sort();
        assert_eq!(members, sorted);
    }

    #[tokio::test]
    async fn test_instances_share_budget() {
        let store = Arc::new(MemoryStore::new());
        let first = SlidingWindowSortedSet::new(limits(2, 60_000), store.clone(), "zset").unwrap();
        let second = SlidingWindowSortedSet::new(limits(2, 60_000), store.clone(), "zset").unwrap();

        assert!(first.is_allowed("user").await.unwrap());
        assert!(second.is_allowed("user").await.unwrap());
        assert!(!first.is_allowed("user").await.unwrap());
        assert!(!second.is_allowed("user").await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_only_touches_own_prefix() {
        let store = Arc::new(MemoryStore::new());
        let list = SlidingWindowSharedList::new(limits(1, 60_000), store.clone(), "list").unwrap();
        store.rpush("unrelated", "1").await.unwrap();

        assert!(list.is_allowed("user").await.unwrap());
        assert!(!list.is_allowed("user").await.unwrap());

        list.reset().await.unwrap();
        assert!(list.is_allowed("user").await.unwrap());
        assert_eq!(store.llen("unrelated").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let limiters = shared_limiters(&store, 3, 60_000);
        ListStore::close(store.as_ref()).await.unwrap();

        for limiter in limiters {
            let err = limiter.is_allowed("user").await.unwrap_err();
            assert!(err.is_store_failure(), "{}", limiter.name());
        }
    }

    #[tokio::test]
    async fn test_destroy_twice() {
        let store = Arc::new(MemoryStore::new());
        for limiter in shared_limiters(&store, 1, 1000) {
            limiter.destroy().await;
            limiter.destroy().await;
        }
    }
}
