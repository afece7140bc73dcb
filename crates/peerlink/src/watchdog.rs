//! Readiness watchdog.
//!
//! The peer engine has no readiness notification, so the watchdog polls its
//! data-channel predicate at a fixed interval until it holds, the deadline
//! passes, or the session is cancelled.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Default handshake timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a readiness wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The data channel opened.
    Ready,
    /// The deadline passed first.
    TimedOut,
    /// The session was cancelled before either.
    Cancelled,
}

/// Bounds the wait for the data channel to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessWatchdog {
    poll_interval: Duration,
    timeout: Duration,
}

impl Default for ReadinessWatchdog {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT, DEFAULT_POLL_INTERVAL)
    }
}

impl ReadinessWatchdog {
    /// Creates a watchdog. A zero poll interval is raised to one millisecond.
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Polls `is_open` until it returns `true`, the timeout elapses, or
    /// `cancel` fires.
    ///
    /// The predicate is checked once immediately, then once per interval.
    /// A timed-out wait returns no later than one poll interval past the
    /// timeout.
    pub async fn wait<F>(&self, is_open: F, cancel: &CancellationToken) -> Readiness
    where
        F: Fn() -> bool,
    {
        let deadline = Instant::now() + self.timeout;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Readiness::Cancelled,
                _ = ticker.tick() => {}
            }

            if is_open() {
                return Readiness::Ready;
            }
            if Instant::now() >= deadline {
                tracing::debug!(timeout = ?self.timeout, "readiness deadline passed");
                return Readiness::TimedOut;
            }
        }
    }
}
