//! Periodic flush task for fixed-window limiters.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{trace, warn};

use crate::error::Result;

/// Callback run at every window boundary.
pub type FlushFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A tokio task that runs a flush callback once per window.
///
/// The task belongs to one limiter: [`WindowTimer::arm`] replaces any running
/// task, [`WindowTimer::cancel`] stops it, and dropping the timer cancels it.
pub struct WindowTimer {
    period: Duration,
    label: &'static str,
    flush: FlushFn,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WindowTimer {
    /// Create an unarmed timer. Call [`arm`](Self::arm) to start it.
    pub fn new(period: Duration, label: &'static str, flush: FlushFn) -> Self {
        Self {
            period,
            label,
            flush,
            handle: Mutex::new(None),
        }
    }

    /// Start (or restart) the timer; the first flush happens one full
    /// period from now.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm(&self) {
        let period = self.period;
        let label = self.label;
        let flush = Arc::clone(&self.flush);

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                trace!(limiter = label, "Window boundary reached, flushing");
                if let Err(e) = flush().await {
                    warn!(limiter = label, error = %e, "Window flush failed");
                }
            }
        });

        if let Some(previous) = self.handle.lock().replace(task) {
            previous.abort();
        }
    }

    /// Stop the timer. Returns `false` if it was not running.
    pub fn cancel(&self) -> bool {
        match self.handle.lock().take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.lock().is_some()
    }
}

impl Drop for WindowTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_timer(period: Duration) -> (WindowTimer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let flush: FlushFn = Arc::new(move || -> BoxFuture<'static, Result<()>> {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Result::Ok(())
            })
        });
        (WindowTimer::new(period, "test", flush), fired)
    }

    #[tokio::test]
    async fn test_timer_fires_each_period() {
        let (timer, fired) = counting_timer(Duration::from_millis(50));
        timer.arm();

        // Does not fire immediately
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert!(fired.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_cancel_stops_timer() {
        let (timer, fired) = counting_timer(Duration::from_millis(30));
        timer.arm();
        assert!(timer.is_armed());

        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(!timer.is_armed());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rearm_restarts_period() {
        let (timer, fired) = counting_timer(Duration::from_millis(100));
        timer.arm();

        tokio::time::sleep(Duration::from_millis(70)).await;
        timer.arm();

        // 140ms after the first arm, but only 70ms after the re-arm
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
