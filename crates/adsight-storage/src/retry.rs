//! Retry classification and capped exponential backoff for calls to
//! rate-limited externals.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Delay schedule for repeated calls against a flaky dependency.
/// `max_attempts` counts every call, the first one included.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// How long to sleep after the given zero-based attempt failed. Doubles
    /// per attempt until the cap.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let doubled = u32::try_from(attempt_index)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(doubled).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_the_cap() {
        let policy = BackoffPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(40),
            max_delay: Duration::from_millis(130),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(40));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(80));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(130));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(130));
    }

    #[test]
    fn default_policy_makes_three_attempts_total() {
        assert_eq!(BackoffPolicy::default().max_attempts, 3);
    }
}
