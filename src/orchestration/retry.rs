//! # Retry Policy
//!
//! Exponential backoff for transient failures at the point they occur.
//! Attempt `n` (1-based) waits `base * multiplier^(n-1)` before the next
//! try, capped at `max_delay`, with optional jitter of up to 10%.

use std::time::Duration;

use crate::config::RetryConfig;

const MAX_JITTER: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        let delay = if self.jitter {
            apply_jitter(capped)
        } else {
            capped
        };
        Duration::from_millis(delay.max(0.0) as u64)
    }
}

fn apply_jitter(millis: f64) -> f64 {
    let range = millis * MAX_JITTER;
    // +/- range
    millis + (fastrand::f64() * 2.0 - 1.0) * range
}

/// Polling backoff: doubles from `base` up to `base * max_factor`
pub fn poll_delay(base: Duration, attempt: u32, max_factor: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16)).min(max_factor.max(1));
    base.saturating_mul(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule_doubles_from_two_seconds() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=6).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 64]);
        assert!(policy.should_retry(5));
        assert!(!policy.should_retry(6));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(10),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(10), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let ms = policy.delay_for(2).as_millis();
            assert!((3_600..=4_400).contains(&ms), "{ms}ms outside jitter band");
        }
    }

    #[test]
    fn test_poll_delay_caps_at_factor() {
        let base = Duration::from_millis(250);
        assert_eq!(poll_delay(base, 0, 8), base);
        assert_eq!(poll_delay(base, 2, 8), Duration::from_millis(1_000));
        assert_eq!(poll_delay(base, 9, 8), Duration::from_millis(2_000));
    }
}
