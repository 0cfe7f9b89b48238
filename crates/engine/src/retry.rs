//! Retry scheduling for failed driver attempts.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with ±25% jitter. Delay precedence for a failed
/// attempt: the server's `Retry-After` hint, then the driver's own delay
/// policy, then this schedule.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial: Duration) -> Self {
        RetryPolicy {
            max_retries,
            initial,
        }
    }

    /// Whether another attempt is allowed after `attempt_no` failed.
    pub fn should_retry(&self, attempt_no: u32) -> bool {
        attempt_no <= self.max_retries
    }

    /// Delay before the attempt following `attempt_no`.
    pub fn delay_for(
        &self,
        attempt_no: u32,
        hint: Option<Duration>,
        driver_delay: Option<Duration>,
    ) -> Duration {
        if let Some(hint) = hint {
            return hint;
        }
        if let Some(delay) = driver_delay {
            return delay;
        }
        let factor = 1u64 << attempt_no.saturating_sub(1).min(16);
        let base_ms = (self.initial.as_millis() as u64).saturating_mul(factor);
        let jitter = rand::rng().random_range(0.75..=1.25);
        Duration::from_millis((base_ms as f64 * jitter) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_are_bounded_by_max_retries() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn hint_overrides_everything() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let delay = policy.delay_for(
            1,
            Some(Duration::from_secs(9)),
            Some(Duration::from_secs(1)),
        );
        assert_eq!(delay, Duration::from_secs(9));
    }

    #[test]
    fn driver_delay_beats_default_schedule() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let delay = policy.delay_for(1, None, Some(Duration::from_secs(2)));
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[test]
    fn default_schedule_grows_exponentially() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        for (attempt, expected_ms) in [(1u32, 100u64), (2, 200), (3, 400)] {
            let ms = policy.delay_for(attempt, None, None).as_millis() as u64;
            assert!(
                (expected_ms * 3 / 4..=expected_ms * 5 / 4).contains(&ms),
                "attempt {attempt}: {ms}ms"
            );
        }
    }
}
