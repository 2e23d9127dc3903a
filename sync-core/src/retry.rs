//! Bounded retry policy.
//!
//! Used for operations that are expected to fail until some other state
//! exists, e.g. initializing sync before a family has been created.

use std::time::Duration;

/// Retry schedule with a hard cap on attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied after each retry (1 = fixed delay).
    pub multiplier: u32,
    /// Longest delay between two attempts.
    pub max_delay: Duration,
    /// Total attempts including the first one.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Fixed delay between attempts.
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay: delay,
            multiplier: 1,
            max_delay: delay,
            max_attempts,
        }
    }

    /// Doubling delay, capped at `max_delay`.
    pub fn exponential(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            multiplier: 2,
            max_delay,
            max_attempts,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// Returns `None` once the attempt budget is spent.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }
        let factor = self.multiplier.saturating_pow((attempt - 1).min(16));
        Some(self.initial_delay.saturating_mul(factor).min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    /// 2 seconds between attempts, 30 attempts.
    fn default() -> Self {
        Self::fixed(Duration::from_secs(2), 30)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_fixed_two_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_after(10), Some(Duration::from_secs(2)));
    }

    #[test]
    fn budget_is_bounded() {
        let policy = RetryPolicy::fixed(Duration::from_millis(10), 3);
        assert!(policy.delay_after(1).is_some());
        assert!(policy.delay_after(2).is_some());
        assert_eq!(policy.delay_after(3), None);
    }

    #[test]
    fn exponential_doubles_up_to_cap() {
        let policy =
            RetryPolicy::exponential(Duration::from_millis(100), Duration::from_millis(500), 10);
        assert_eq!(policy.delay_after(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_after(3), Some(Duration::from_millis(400)));
        assert_eq!(policy.delay_after(4), Some(Duration::from_millis(500)));
    }

    #[test]
    fn attempt_zero_has_no_delay() {
        assert_eq!(RetryPolicy::default().delay_after(0), None);
    }
}
