//! The supervisor state machine.
//!
//! ```text
//!  Stopped --start--> Starting --handshake ok--> Ready <--> Degraded
//!     ^                   |                        |
//!     |                   +---handshake fails-->  Error
//!     +-------------------------stop()-------------+
//! ```
//!
//! `Degraded` is entered when a connection's `health_check_tool` fails twice
//! in a row while `Ready`; it recovers back to `Ready` on the next
//! successful check, or escalates to a restart (via the usual exit path) on
//! the next failure.

use std::time::Duration;

/// Where a supervised child currently sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Ready,
    Degraded,
    Stopping,
    Error,
}

impl SupervisorState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }
}

/// Tracks consecutive failures and the next backoff delay to apply.
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    pub failures: u32,
}

impl Backoff {
    #[must_use]
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            failures: 0,
        }
    }

    /// Records a failure and returns the delay to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.failures += 1;
        let delay = self.current;
        self.current = self.current.mul_f64(1.5).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_by_one_and_a_half_until_capped() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(750));
        assert_eq!(backoff.next_delay(), Duration::from_micros(1_125_000));
        assert_eq!(backoff.failures, 3);
    }

    #[test]
    fn backoff_eventually_caps_at_max() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(5));
        let mut last = Duration::ZERO;
        for _ in 0..30 {
            last = backoff.next_delay();
            assert!(last <= Duration::from_secs(5));
        }
        assert_eq!(last, Duration::from_secs(5));
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(5));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.failures, 1);
    }
}
