//! Retry policy: decides the backoff pause before a failed job is re-published.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay for the first retry.
    pub base_delay: Duration,

    /// 1.0 gives a fixed pause.
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Same pause before every retry.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            multiplier: 1.0,
        }
    }

    pub fn exponential(base_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            multiplier,
        }
    }

    /// No pause at all; used by tests.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Pause after the `attempts`-th attempt failed (1-indexed):
    /// `base_delay * multiplier^(attempts - 1)`.
    ///
    /// With base_delay=2s, multiplier=2.0:
    /// - attempt 1: 2s
    /// - attempt 2: 4s
    /// - attempt 3: 8s
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = base_secs * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    /// Fixed two second pause.
    fn default() -> Self {
        Self::fixed(Duration::from_secs(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_policy_is_fixed_two_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(5), Duration::from_secs(2));
    }

    #[rstest]
    #[case(0, 2)]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(3, 8)]
    fn exponential_backoff_increases(#[case] attempts: u32, #[case] secs: u64) {
        let policy = RetryPolicy::exponential(Duration::from_secs(2), 2.0);
        assert_eq!(policy.next_delay(attempts), Duration::from_secs(secs));
    }

    #[test]
    fn overflow_saturates() {
        let policy = RetryPolicy::exponential(Duration::from_secs(1), 10.0);
        assert_eq!(policy.next_delay(u32::MAX), Duration::MAX);
    }
}
