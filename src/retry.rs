use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff shared by the source chain and the store
/// gateway: `base * 2^(attempt-1)`, capped, optionally jittered upward.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Extra random delay as a fraction of the computed delay (0.0 = none)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt number `attempt`
    /// (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        delay.mul_f64(1.0 + extra)
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter: 0.0,
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_secs(1));
        assert_eq!(p.backoff(2), Duration::from_secs(2));
        assert_eq!(p.backoff(3), Duration::from_secs(4));
        assert_eq!(p.backoff(4), Duration::from_secs(5));
        assert_eq!(p.backoff(40), Duration::from_secs(5));
    }

    #[test]
    fn jitter_only_adds() {
        let p = RetryPolicy {
            jitter: 0.5,
            ..policy()
        };
        for _ in 0..50 {
            let d = p.backoff(2);
            assert!(d >= Duration::from_secs(2));
            assert!(d <= Duration::from_secs(3));
        }
    }

    #[test]
    fn three_attempts_means_two_retries() {
        let p = policy();
        assert!(p.should_retry(1));
        assert!(p.should_retry(2));
        assert!(!p.should_retry(3));
    }
}
