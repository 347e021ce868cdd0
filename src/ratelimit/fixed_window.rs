//! Fixed-window rate limiters.
//!
//! Time is cut into back-to-back windows of `time_interval` milliseconds. A
//! timer owned by the limiter clears every counter at each boundary, so all
//! callers reset in lockstep rather than relative to their first action.
//!
//! Known limitation: a caller can get up to `2 * threshold` actions through
//! in a very short span by acting just before and just after a boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tracing::{debug, info, trace, warn};

use super::limiter::{LimitConfig, RateLimiter};
use super::timer::{FlushFn, WindowTimer};
use crate::error::Result;
use crate::store::{cache_key, CounterStore};

/// Fixed window with counters kept in local memory.
///
/// Counts are not shared between processes: behind a load balancer each
/// instance grants its own `threshold`.
pub struct FixedWindowInMemory {
    limits: LimitConfig,
    counts: Arc<DashMap<String, u64>>,
    timer: WindowTimer,
    destroyed: AtomicBool,
}

impl FixedWindowInMemory {
    pub const NAME: &'static str = "fixed-window-in-memory";

    /// Create the limiter and start its window timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(limits: LimitConfig) -> Result<Self> {
        limits.validate()?;

        let counts: Arc<DashMap<String, u64>> = Arc::new(DashMap::new());
        let flush_counts = Arc::clone(&counts);
        let flush: FlushFn = Arc::new(move || -> BoxFuture<'static, Result<()>> {
            let counts = Arc::clone(&flush_counts);
            Box::pin(async move {
                counts.clear();
                Result::Ok(())
            })
        });

        let timer = WindowTimer::new(limits.window(), Self::NAME, flush);
        timer.arm();

        info!(
            limiter = Self::NAME,
            threshold = limits.threshold,
            time_interval_ms = limits.time_interval_ms,
            "Rate limiter initialized"
        );

        Ok(Self {
            limits,
            counts,
            timer,
            destroyed: AtomicBool::new(false),
        })
    }

    /// Actions recorded for a caller in the current window.
    pub fn current_count(&self, caller_id: &str) -> u64 {
        self.counts.get(caller_id).map_or(0, |count| *count)
    }

    /// Number of callers seen in the current window.
    pub fn tracked_callers(&self) -> usize {
        self.counts.len()
    }
}

#[async_trait]
impl RateLimiter for FixedWindowInMemory {
    async fn is_allowed(&self, caller_id: &str) -> Result<bool> {
        let mut count = self.counts.entry(caller_id.to_string()).or_insert(0);

        if *count >= self.limits.threshold {
            debug!(limiter = Self::NAME, caller = %caller_id, count = *count, "Rate limit exceeded");
            return Ok(false);
        }

        *count += 1;
        trace!(limiter = Self::NAME, caller = %caller_id, count = *count, "Action allowed");
        Ok(true)
    }

    fn threshold(&self) -> u64 {
        self.limits.threshold
    }

    fn time_interval(&self) -> u64 {
        self.limits.time_interval_ms
    }

    async fn reset(&self) -> Result<()> {
        self.counts.clear();
        if !self.destroyed.load(Ordering::SeqCst) {
            self.timer.arm();
        }
        debug!(limiter = Self::NAME, "Rate limiter reset");
        Ok(())
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.timer.cancel();
        info!(limiter = Self::NAME, "Rate limiter destroyed");
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }
}

/// Fixed window with counters in a shared cache (memcached).
///
/// Every process pointing at the same cache sees the same counts. The
/// read-then-write in [`is_allowed`](RateLimiter::is_allowed) is two round
/// trips, so concurrent calls for one caller can both pass the check.
pub struct FixedWindowSharedCache<S: CounterStore + 'static> {
    limits: LimitConfig,
    store: Arc<S>,
    key_prefix: String,
    timer: WindowTimer,
    destroyed: AtomicBool,
}

impl<S: CounterStore + 'static> FixedWindowSharedCache<S> {
    pub const NAME: &'static str = "fixed-window-memcached";

    /// Create the limiter over a connected store and start its flush timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(limits: LimitConfig, store: Arc<S>, key_prefix: impl Into<String>) -> Result<Self> {
        limits.validate()?;

        let flush_store = Arc::clone(&store);
        let flush: FlushFn = Arc::new(move || -> BoxFuture<'static, Result<()>> {
            let store = Arc::clone(&flush_store);
            Box::pin(async move { store.flush().await })
        });

        let timer = WindowTimer::new(limits.window(), Self::NAME, flush);
        timer.arm();

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
            timer,
            destroyed: AtomicBool::new(false),
        })
    }

    /// Cache expiry for a counter: the window rounded up to whole seconds.
    fn ttl_secs(&self) -> u64 {
        self.limits.time_interval_ms.div_ceil(1000).max(1)
    }
}

#[async_trait]
impl<S: CounterStore + 'static> RateLimiter for FixedWindowSharedCache<S> {
    async fn is_allowed(&self, caller_id: &str) -> Result<bool> {
        let key = cache_key(&self.key_prefix, caller_id);
        let count = self.store.get(&key).await?.unwrap_or(0);

        if count >= self.limits.threshold {
            debug!(limiter = Self::NAME, caller = %caller_id, count = count, "Rate limit exceeded");
            return Ok(false);
        }

        self.store.set(&key, count + 1, self.ttl_secs()).await?;
        trace!(limiter = Self::NAME, caller = %caller_id, count = count + 1, "Action allowed");
        Ok(true)
    }

    fn threshold(&self) -> u64 {
        self.limits.threshold
    }

    fn time_interval(&self) -> u64 {
        self.limits.time_interval_ms
    }

    async fn reset(&self) -> Result<()> {
        let flushed = self.store.flush().await;
        if !self.destroyed.load(Ordering::SeqCst) {
            self.timer.arm();
        }
        debug!(limiter = Self::NAME, "Rate limiter reset");
        flushed
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.timer.cancel();
        if let Err(e) = self.store.close().await {
            warn!(limiter = Self::NAME, error = %e, "Failed to close cache connection");
        }
        info!(limiter = Self::NAME, "Rate limiter destroyed");
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }
}
