//! Strategy selection and limiter lifecycle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::fixed_window::{FixedWindowInMemory, FixedWindowSharedCache};
use super::limiter::{LimitConfig, RateLimiter};
use super::sliding_local::{SlidingWindowList, SlidingWindowMinHeap};
use super::sliding_shared::{SlidingWindowSharedList, SlidingWindowSortedSet};
use crate::config::LimiterConfig;
use crate::error::Result;
use crate::store::{MemcachedStore, RedisStore};

/// The available rate limiting strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Fixed window, counters in local memory
    #[default]
    FixedWindowInMemory,
    /// Fixed window, counters in memcached
    FixedWindowMemcached,
    /// Sliding window, min-heap per caller in local memory
    SlidingWindowMinHeap,
    /// Sliding window, FIFO list per caller in local memory
    SlidingWindowList,
    /// Sliding window, redis list per caller
    SlidingWindowRedisList,
    /// Sliding window, redis sorted set per caller
    SlidingWindowRedisSortedSet,
}

impl Strategy {
    /// The strategy name, as used in configuration and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::FixedWindowInMemory => "fixed-window-in-memory",
            Strategy::FixedWindowMemcached => "fixed-window-memcached",
            Strategy::SlidingWindowMinHeap => "sliding-window-min-heap",
            Strategy::SlidingWindowList => "sliding-window-list",
            Strategy::SlidingWindowRedisList => "sliding-window-redis-list",
            Strategy::SlidingWindowRedisSortedSet => "sliding-window-redis-sorted-set",
        }
    }

    /// Whether this strategy needs an external store.
    pub fn is_shared(&self) -> bool {
        matches!(
            self,
            Strategy::FixedWindowMemcached
                | Strategy::SlidingWindowRedisList
                | Strategy::SlidingWindowRedisSortedSet
        )
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the configured limiter, connecting to its store first if it has one.
///
/// Connection failures are returned here instead of surfacing later as
/// failed decisions. Must be called from within a tokio runtime.
pub async fn create_rate_limiter(config: &LimiterConfig) -> Result<Arc<dyn RateLimiter>> {
    let limits = LimitConfig::new(config.threshold, config.time_interval_ms)?;
    debug!(strategy = %config.strategy, "Creating rate limiter");

    let limiter: Arc<dyn RateLimiter> = match config.strategy {
        Strategy::FixedWindowInMemory => Arc::new(FixedWindowInMemory::new(limits)?),
        Strategy::FixedWindowMemcached => {
            let store = Arc::new(MemcachedStore::connect(&config.memcached_url).await?);
            Arc::new(FixedWindowSharedCache::new(limits, store, config.key_prefix.as_str())?)
        }
        Strategy::SlidingWindowMinHeap => Arc::new(SlidingWindowMinHeap::new(limits)?),
        Strategy::SlidingWindowList => Arc::new(SlidingWindowList::new(limits)?),
        Strategy::SlidingWindowRedisList => {
            let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
            Arc::new(SlidingWindowSharedList::new(limits, store, config.key_prefix.as_str())?)
        }
        Strategy::SlidingWindowRedisSortedSet => {
            let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
            Arc::new(SlidingWindowSortedSet::new(limits, store, config.key_prefix.as_str())?)
        }
    };

    Ok(limiter)
}

/// Owns a limiter and makes sure its teardown hook runs.
///
/// Call [`shutdown`](Self::shutdown) on the way out. If the guard is dropped
/// without it, `destroy()` is scheduled on the current tokio runtime instead.
pub struct LimiterGuard {
    limiter: Arc<dyn RateLimiter>,
    shut_down: AtomicBool,
}

impl LimiterGuard {
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            limiter,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Create the configured limiter and wrap it in a guard.
    pub async fn create(config: &LimiterConfig) -> Result<Self> {
        Ok(Self::new(create_rate_limiter(config).await?))
    }

    /// A handle to the guarded limiter for request handling.
    pub fn limiter(&self) -> Arc<dyn RateLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Run the limiter's teardown. Only the first call does anything.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(limiter = self.limiter.name(), "Tearing down rate limiter");
        self.limiter.destroy().await;
    }
}

impl Drop for LimiterGuard {
    fn drop(&mut self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let limiter = Arc::clone(&self.limiter);
            handle.spawn(async move { limiter.destroy().await });
        }
    }
}
