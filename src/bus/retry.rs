use std::time::Duration;

/// Exponential backoff applied between redeliveries of a nacked message.
///
/// The delay before delivery attempt `n + 1` is `min_backoff * 2^(n - 1)`,
/// clamped to `max_backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// Delay before the message becomes redeliverable after its `attempt`-th
    /// delivery was nacked. Attempts are 1-based.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.min_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy {
            min_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(600),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(10));
        assert_eq!(policy.delay(2), Duration::from_secs(20));
        assert_eq!(policy.delay(3), Duration::from_secs(40));
        assert_eq!(policy.delay(4), Duration::from_secs(80));
    }

    #[test]
    fn delay_is_clamped_to_max() {
        let policy = RetryPolicy {
            min_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(600),
        };
        assert_eq!(policy.delay(7), Duration::from_secs(600));
        assert_eq!(policy.delay(100), Duration::from_secs(600));
    }

    #[test]
    fn zero_attempt_is_treated_as_first() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), policy.delay(1));
    }
}
