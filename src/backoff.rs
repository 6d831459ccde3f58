//! Reconnect backoff policy.
//!
//! The delay is a pure step function of the number of failed attempts
//! since the link last reached AUTHENTICATED. The timer state lives with
//! the writer loop; the scheduling decision is re-evaluated on every
//! writer wakeup, so a freshly queued packet never waits longer than the
//! remaining backoff.

use std::time::Duration;

use tokio::time::Instant;

/// Backoff delay for the given reconnect attempt count.
///
/// The count is the number of consecutive failures since the last
/// AUTHENTICATED state, not since CONNECTED.
#[must_use]
pub fn reconnect_delay(reconnect_count: u32) -> Duration {
    let secs = match reconnect_count {
        0..=2 => 2,
        3..=5 => 5,
        6..=9 => 30,
        _ => 60,
    };
    Duration::from_secs(secs)
}

/// Reconnect timer state owned by the writer loop.
#[derive(Debug)]
pub(crate) struct ReconnectTimer {
    next_attempt_at: Instant,
    reconnect_count: u32,
}

impl ReconnectTimer {
    pub(crate) fn new() -> Self {
        Self {
            next_attempt_at: Instant::now(),
            reconnect_count: 0,
        }
    }

    /// Record a failed attempt and schedule the next one per the table.
    pub(crate) fn schedule_retry(&mut self) {
        let delay = reconnect_delay(self.reconnect_count);
        self.reconnect_count += 1;
        self.next_attempt_at = Instant::now() + delay;
    }

    /// Reset the counter. Called only when the link reaches AUTHENTICATED.
    pub(crate) fn reset(&mut self) {
        self.reconnect_count = 0;
    }

    pub(crate) fn reconnect_count(&self) -> u32 {
        self.reconnect_count
    }

    /// Time left until the next attempt, `None` once the deadline passed.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        (self.next_attempt_at > now).then(|| self.next_attempt_at - now)
    }
}
