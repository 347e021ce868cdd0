//! The rate limiter contract shared by every windowing strategy.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{RateWindowError, Result};

/// Default number of actions allowed per window.
pub const DEFAULT_THRESHOLD: u64 = 5;
/// Default window length in milliseconds (10 minutes).
pub const DEFAULT_TIME_INTERVAL_MS: u64 = 600_000;
/// Longest accepted window in milliseconds (365 days).
pub const MAX_TIME_INTERVAL_MS: u64 = 365 * 24 * 60 * 60 * 1000;

/// Trait for rate limiter implementations.
///
/// Every strategy (fixed or sliding window, local or shared store) implements
/// this so the HTTP layer can work with any of them behind an `Arc<dyn _>`.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Decide whether `caller_id` may act now.
    ///
    /// The action is recorded if and only if this returns `Ok(true)`.
    /// Shared-store strategies return an error when the store fails rather
    /// than guessing a decision.
    async fn is_allowed(&self, caller_id: &str) -> Result<bool>;

    /// Maximum number of actions allowed per window.
    fn threshold(&self) -> u64;

    /// Window length in milliseconds.
    fn time_interval(&self) -> u64;

    /// Discard all counting state and re-arm any periodic timer.
    async fn reset(&self) -> Result<()>;

    /// Release timers and store connections. Safe to call more than once.
    async fn destroy(&self);

    /// Short strategy name used in logs.
    fn name(&self) -> &'static str;
}

/// Threshold and window shared by all strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitConfig {
    /// Maximum actions allowed in the window
    pub threshold: u64,
    /// Window length in milliseconds
    pub time_interval_ms: u64,
}

impl LimitConfig {
    /// Create a validated limit configuration.
    pub fn new(threshold: u64, time_interval_ms: u64) -> Result<Self> {
        let config = Self {
            threshold,
            time_interval_ms,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject non-positive thresholds and intervals, and intervals longer
    /// than [`MAX_TIME_INTERVAL_MS`].
    pub fn validate(&self) -> Result<()> {
        if self.threshold == 0 {
            return Err(RateWindowError::Config(
                "threshold must be a positive integer".to_string(),
            ));
        }
        if self.time_interval_ms == 0 {
            return Err(RateWindowError::Config(
                "time interval must be a positive number of milliseconds".to_string(),
            ));
        }
        if self.time_interval_ms > MAX_TIME_INTERVAL_MS {
            return Err(RateWindowError::Config(format!(
                "time interval must be at most {} milliseconds, got {}",
                MAX_TIME_INTERVAL_MS, self.time_interval_ms
            )));
        }
        Ok(())
    }

    /// The window as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.time_interval_ms)
    }

    /// Oldest timestamp still inside a sliding window ending at `now`.
    pub fn window_start(&self, now: i64) -> i64 {
        now.saturating_sub(self.time_interval_ms as i64)
    }
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            time_interval_ms: DEFAULT_TIME_INTERVAL_MS,
        }
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Shared-store strategies compare timestamps written by other processes, so
/// they need a clock every process agrees on.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Milliseconds elapsed since the clock was created, never going backwards.
///
/// Used by the in-process sliding windows, whose logs must stay ordered even
/// if the wall clock is stepped back.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_millis(&self) -> i64 {
        i64::try_from(self.origin.elapsed().as_millis()).unwrap_or(i64::MAX)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
