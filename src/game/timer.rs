//! Match Timer
//!
//! Countdown abstraction driving phase transitions without blocking the
//! caller. A scheduled timer ticks at sub-second granularity so clients
//! can render a live countdown, and fires its expiry callback exactly
//! once unless canceled first.
//!
//! Cancellation is always safe: canceling after expiry, or canceling
//! twice, is a no-op. Dropping a handle cancels the underlying task, so
//! a match that is torn down can never fire a stale timer.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Countdown tick granularity.
pub const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Handle to a scheduled countdown.
///
/// Each match owns at most one of these at a time; arming a new timer
/// on a match cancels and discards the prior handle.
#[derive(Debug)]
pub struct TimerHandle {
    fired_or_canceled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Cancel the countdown. Idempotent; safe after expiry.
    ///
    /// Only aborts the task when the expiry has not already fired, so
    /// an expiry callback that tears down its own match (and with it
    /// this handle) never aborts itself mid-flight.
    pub fn cancel(&self) {
        if !self.fired_or_canceled.swap(true, Ordering::SeqCst) {
            self.task.abort();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Schedule a countdown of `duration`.
///
/// `on_tick` is invoked with the whole seconds remaining (rounded up) at
/// each tick while the countdown runs; `on_expire` is invoked exactly
/// once when the duration elapses, unless the handle is canceled first.
/// Neither call blocks the scheduler.
pub fn schedule<T, TFut, E, EFut>(duration: Duration, on_tick: T, on_expire: E) -> TimerHandle
where
    T: Fn(u64) -> TFut + Send + 'static,
    TFut: Future<Output = ()> + Send,
    E: FnOnce() -> EFut + Send + 'static,
    EFut: Future<Output = ()> + Send,
{
    let fired_or_canceled = Arc::new(AtomicBool::new(false));
    let flag = fired_or_canceled.clone();

    let task = tokio::spawn(async move {
        let deadline = Instant::now() + duration;
        let mut ticker = interval_at(Instant::now() + TICK_INTERVAL, TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if flag.load(Ordering::SeqCst) {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            on_tick(seconds_left(remaining)).await;
        }

        // Exactly-once: a concurrent cancel wins the swap and we bail.
        if !flag.swap(true, Ordering::SeqCst) {
            on_expire().await;
        }
    });

    TimerHandle {
        fired_or_canceled,
        task,
    }
}

/// Whole seconds remaining, rounded up for display.
fn seconds_left(remaining: Duration) -> u64 {
    (remaining.as_millis() as u64 + 999) / 1000
}
