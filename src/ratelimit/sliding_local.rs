//! Sliding-window rate limiters over in-process timestamp logs.
//!
//! Each caller keeps the timestamps of its recent allowed actions. Before
//! every decision, timestamps older than `now - time_interval` are pruned;
//! the caller is allowed only if fewer than `threshold` remain. Unlike the
//! fixed window there is no burst at window edges.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, trace};

use super::heap::BoundedMinHeap;
use super::limiter::{LimitConfig, MonotonicClock, RateLimiter};
use super::queue::TimestampQueue;
use crate::error::Result;

/// Sliding window backed by a bounded min-heap per caller.
///
/// The heap capacity equals the threshold. Pruning pops the minimum, so a
/// call costs `O(log threshold)` amortized.
pub struct SlidingWindowMinHeap {
    limits: LimitConfig,
    clock: MonotonicClock,
    logs: DashMap<String, BoundedMinHeap<i64>>,
}

impl SlidingWindowMinHeap {
    pub const NAME: &'static str = "sliding-window-min-heap";

    pub fn new(limits: LimitConfig) -> Result<Self> {
        limits.validate()?;
        info!(
            limiter = Self::NAME,
            threshold = limits.threshold,
            time_interval_ms = limits.time_interval_ms,
            "Rate limiter initialized"
        );
        Ok(Self {
            limits,
            clock: MonotonicClock::new(),
            logs: DashMap::new(),
        })
    }

    pub(crate) fn decide_at(&self, caller_id: &str, now: i64) -> Result<bool> {
        let window_start = self.limits.window_start(now);
        let capacity = usize::try_from(self.limits.threshold).unwrap_or(usize::MAX);
        let mut heap = self
            .logs
            .entry(caller_id.to_string())
            .or_insert_with(|| BoundedMinHeap::with_capacity(capacity));

        while !heap.is_empty() && heap.peek()? < window_start {
            heap.pop()?;
        }

        if heap.len() as u64 >= self.limits.threshold {
            debug!(limiter = Self::NAME, caller = %caller_id, in_window = heap.len(), "Rate limit exceeded");
            return Ok(false);
        }

        heap.push(now)?;
        trace!(limiter = Self::NAME, caller = %caller_id, in_window = heap.len(), "Action allowed");
        Ok(true)
    }

    /// Timestamps currently held for a caller, stale ones included.
    pub fn logged_actions(&self, caller_id: &str) -> usize {
        self.logs.get(caller_id).map_or(0, |heap| heap.len())
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowMinHeap {
    async fn is_allowed(&self, caller_id: &str) -> Result<bool> {
        self.decide_at(caller_id, self.clock.now_millis())
    }

    fn threshold(&self) -> u64 {
        self.limits.threshold
    }

    fn time_interval(&self) -> u64 {
        self.limits.time_interval_ms
    }

    async fn reset(&self) -> Result<()> {
        self.logs.clear();
        debug!(limiter = Self::NAME, "Rate limiter reset");
        Ok(())
    }

    async fn destroy(&self) {}

    fn name(&self) -> &'static str {
        Self::NAME
    }
}

/// Sliding window backed by a FIFO queue per caller.
///
/// Timestamps arrive in non-decreasing order, so the head is always the
/// oldest entry and pruning is a run of `pop_front` calls with no re-heapify.
pub struct SlidingWindowList {
    limits: LimitConfig,
    clock: MonotonicClock,
    logs: DashMap<String, TimestampQueue>,
}

impl SlidingWindowList {
    pub const NAME: &'static str = "sliding-window-list";

    pub fn new(limits: LimitConfig) -> Result<Self> {
        limits.validate()?;
        info!(
            limiter = Self::NAME,
            threshold = limits.threshold,
            time_interval_ms = limits.time_interval_ms,
            "Rate limiter initialized"
        );
        Ok(Self {
            limits,
            clock: MonotonicClock::new(),
            logs: DashMap::new(),
        })
    }

    pub(crate) fn decide_at(&self, caller_id: &str, now: i64) -> Result<bool> {
        let window_start = self.limits.window_start(now);
        let mut queue = self.logs.entry(caller_id.to_string()).or_default();

        while !queue.is_empty() && queue.front()? < window_start {
            queue.pop_front()?;
        }

        if queue.len() as u64 >= self.limits.threshold {
            debug!(limiter = Self::NAME, caller = %caller_id, in_window = queue.len(), "Rate limit exceeded");
            return Ok(false);
        }

        queue.push_back(now);
        trace!(limiter = Self::NAME, caller = %caller_id, in_window = queue.len(), "Action allowed");
        Ok(true)
    }

    /// Timestamps currently held for a caller, stale ones included.
    pub fn logged_actions(&self, caller_id: &str) -> usize {
        self.logs.get(caller_id).map_or(0, |queue| queue.len())
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowList {
    async fn is_allowed(&self, caller_id: &str) -> Result<bool> {
        self.decide_at(caller_id, self.clock.now_millis())
    }

    fn threshold(&self) -> u64 {
        self.limits.threshold
    }

    fn time_interval(&self) -> u64 {
        self.limits.time_interval_ms
    }

    async fn reset(&self) -> Result<()> {
        self.logs.clear();
        debug!(limiter = Self::NAME, "Rate limiter reset");
        Ok(())
    }

    async fn destroy(&self) {}

    fn name(&self) -> &'static str {
        Self::NAME
    }
}
