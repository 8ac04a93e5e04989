//! Reconnection and offline-send policies.

use std::time::Duration;

/// Delay growth between reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Every attempt waits `base_delay`.
    Fixed,
    /// Attempt `n` waits `base_delay * 2^(n-1)`, capped at `max_delay`.
    #[default]
    Exponential,
}

/// How a dropped connection is re-established.
///
/// A client with no policy (or `max_attempts == Some(0)`) goes straight to
/// `Disconnected` when the transport fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts before giving up; `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Delay growth.
    pub backoff: Backoff,
    /// Delay before the first attempt.
    pub base_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff: Backoff::Exponential,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Fixed-delay policy with a bounded number of attempts.
    #[must_use]
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            backoff: Backoff::Fixed,
            base_delay: delay,
            max_delay: delay,
        }
    }

    /// Returns `true` if the policy allows at least one attempt.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.max_attempts != Some(0)
    }

    /// Returns `true` once `attempts` attempts have been made and no more
    /// are allowed.
    #[must_use]
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    /// Delay to wait before attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

/// What `send` does while the connection is not `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineSendPolicy {
    /// Wait for the connection, with at most `capacity` senders waiting.
    Queue {
        /// Maximum number of waiting senders.
        capacity: usize,
    },
    /// Fail immediately with `NotConnected`.
    Reject,
}

impl Default for OfflineSendPolicy {
    fn default() -> Self {
        Self::Queue { capacity: 256 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_until_cap() {
        let policy = ReconnectPolicy {
            max_attempts: None,
            backoff: Backoff::Exponential,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        let delays: Vec<u128> = (1..=5)
            .map(|n| policy.delay_for_attempt(n).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn fixed_never_grows() {
        let policy = ReconnectPolicy::fixed(3, Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(100));
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for_attempt(u32::MAX), policy.max_delay);
    }

    #[test]
    fn exhaustion_follows_max_attempts() {
        let policy = ReconnectPolicy::fixed(3, Duration::from_millis(10));
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(!ReconnectPolicy::default().is_exhausted(u32::MAX));
    }

    #[test]
    fn zero_attempts_disables() {
        assert!(!ReconnectPolicy::fixed(0, Duration::ZERO).is_enabled());
        assert!(ReconnectPolicy::default().is_enabled());
    }
}
