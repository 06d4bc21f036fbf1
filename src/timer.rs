//! Cancellable one-shot phase timers.
//!
//! Each scheduled timer is a tokio task that sleeps and then posts a [`TimerFired`]
//! message back to the state machine's loop; the callback logic itself always runs on
//! the state machine task. Cancelling aborts the sleeping task. Cancelling a timer
//! that already fired is a no-op, and a message that was posted just before
//! cancellation is recognised as stale by its token and dropped by the receiver.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::trial::Phase;

/// Identity of one scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

/// Posted when a timer's delay has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    /// Which timer
    pub token: TimerToken,
    /// Phase that armed it
    pub armed_in: Phase,
}

/// Handle to a scheduled timer.
#[derive(Debug)]
pub struct TimerHandle {
    token: TimerToken,
    armed_in: Phase,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Whether `fired` came from this timer.
    pub fn matches(&self, fired: &TimerFired) -> bool {
        self.token == fired.token && self.armed_in == fired.armed_in
    }

    /// Cancel the timer. Safe to call after it fired.
    pub fn cancel(self) {
        self.task.abort();
    }
}

/// Timer factory plus the channel fired timers report on.
#[derive(Debug)]
pub struct Timers {
    tx: mpsc::UnboundedSender<TimerFired>,
    rx: mpsc::UnboundedReceiver<TimerFired>,
    next_token: u64,
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}

impl Timers {
    /// Create an empty timer set.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            next_token: 0,
        }
    }

    /// Schedule a one-shot timer that reports after `delay`.
    pub fn schedule(&mut self, delay: Duration, armed_in: Phase) -> TimerHandle {
        self.next_token += 1;
        let token = TimerToken(self.next_token);
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(TimerFired { token, armed_in });
        });
        tracing::trace!(?token, ?armed_in, delay_ms = delay.as_millis() as u64, "Timer armed");
        TimerHandle {
            token,
            armed_in,
            task,
        }
    }

    /// Next fired timer. Pending forever while nothing has fired.
    pub async fn next_fired(&mut self) -> Option<TimerFired> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let mut timers = Timers::new();
        let start = tokio::time::Instant::now();
        let handle = timers.schedule(Duration::from_millis(250), Phase::Iti);

        let fired = timers.next_fired().await.unwrap();
        assert!(handle.matches(&fired));
        assert_eq!(fired.armed_in, Phase::Iti);
        assert_eq!(start.elapsed(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_reports() {
        let mut timers = Timers::new();
        let cancelled = timers.schedule(Duration::from_millis(100), Phase::Ttc);
        let kept = timers.schedule(Duration::from_millis(300), Phase::Sample);
        cancelled.cancel();

        let fired = timers.next_fired().await.unwrap();
        assert!(kept.matches(&fired));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_fire_is_noop() {
        let mut timers = Timers::new();
        let handle = timers.schedule(Duration::from_millis(10), Phase::DoorClosing);
        let fired = timers.next_fired().await.unwrap();
        assert!(handle.matches(&fired));
        handle.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_are_unique() {
        let mut timers = Timers::new();
        let a = timers.schedule(Duration::from_millis(10), Phase::Iti);
        let b = timers.schedule(Duration::from_millis(10), Phase::Iti);
        assert_ne!(a.token, b.token);

        let first = timers.next_fired().await.unwrap();
        assert!(a.matches(&first) != b.matches(&first));
    }
}
