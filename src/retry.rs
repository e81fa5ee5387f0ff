//! Exponential backoff for retry policies
//!
//! Backoff for a given attempt is `base_delay * multiplier^attempt`, capped at
//! `max_delay`, with optional jitter that scales the delay into 50-100% of
//! its calculated value.

use crate::config::RetryPolicy;
use rand::Rng;
use std::time::Duration;

impl RetryPolicy {
    /// Calculate backoff duration for a given attempt number (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(30) as i32;
        let base = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay_ms as f64);

        let delay = if self.jitter {
            let jitter = rand::thread_rng().gen_range(0.5..=1.0);
            capped * jitter
        } else {
            capped
        };

        Duration::from_millis(delay.round() as u64)
    }

    /// Whether `attempts` used up the whole budget
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy::new(5, base_ms, max_ms).with_jitter(false)
    }

    // Test 1: Exponential backoff calculation without jitter
    #[test]
    fn test_exponential_backoff_calculation() {
        let policy = policy(5_000, 300_000);

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(40));
    }

    // Test 2: Backoff is capped at max_delay
    #[test]
    fn test_backoff_capped_at_max() {
        let policy = policy(10_000, 60_000);

        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(60));
        // Large attempt numbers must not overflow
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    // Test 3: Jitter keeps backoff within 50-100% of the calculated value
    #[test]
    fn test_jitter_within_range() {
        let policy = RetryPolicy::new(3, 10_000, 300_000).with_jitter(true);

        for _ in 0..100 {
            let backoff = policy.delay_for_attempt(0);
            assert!(
                backoff >= Duration::from_secs(5) && backoff <= Duration::from_secs(10),
                "Backoff {:?} should be between 5-10 seconds",
                backoff
            );
        }
    }

    // Test 4: Custom multiplier
    #[test]
    fn test_custom_multiplier() {
        let mut policy = policy(1_000, 100_000);
        policy.backoff_multiplier = 3.0;

        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(9));
    }

    // Test 5: Exhaustion counts total attempts
    #[test]
    fn test_is_exhausted() {
        let policy = RetryPolicy::new(2, 1_000, 1_000);

        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(1));
        assert!(policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
    }
}
