//! Rate limiting strategies and their shared contract.

mod factory;
mod fixed_window;
mod heap;
mod limiter;
mod queue;
mod sliding_local;
mod sliding_shared;
mod timer;

pub use factory::{create_rate_limiter, LimiterGuard, Strategy};
pub use fixed_window::{FixedWindowInMemory, FixedWindowSharedCache};
pub use heap::BoundedMinHeap;
pub use limiter::{
    now_millis, LimitConfig, MonotonicClock, RateLimiter, DEFAULT_THRESHOLD,
    DEFAULT_TIME_INTERVAL_MS, MAX_TIME_INTERVAL_MS,
};
pub use queue::TimestampQueue;
pub use sliding_local::{SlidingWindowList, SlidingWindowMinHeap};
pub use sliding_shared::{SlidingWindowSharedList, SlidingWindowSortedSet};
pub use timer::{FlushFn, WindowTimer};
