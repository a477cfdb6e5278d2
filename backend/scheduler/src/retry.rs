//! Retry policy: bounded attempts with exponential backoff.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use jobforge_config::RetryConfig;
use jobforge_core::Job;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts, including the first, for jobs without their own retry count.
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    pub base_delay_ms: u64,
    /// Multiplier for each subsequent wait (exponential factor).
    pub multiplier: f64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay_ms: config.base_delay_ms,
            multiplier: config.multiplier,
            max_delay_ms: config.max_delay_ms,
        }
    }
}

impl RetryPolicy {
    /// Compute the delay before retry `retry_number` (1-indexed).
    pub fn delay_for(&self, retry_number: u32) -> Duration {
        if retry_number == 0 {
            return Duration::ZERO;
        }
        let exponent = (retry_number - 1).min(i32::MAX as u32) as i32;
        let delay_ms = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let delay_ms = delay_ms.min(self.max_delay_ms as f64).max(0.0) as u64;
        Duration::from_millis(delay_ms)
    }

    /// Whether another attempt follows `attempts_made` out of `max_attempts`.
    pub fn should_retry(&self, attempts_made: u32, max_attempts: u32) -> bool {
        attempts_made < max_attempts
    }

    /// A job's own retry count wins over the policy default.
    pub fn max_attempts_for(&self, job: &Job) -> u32 {
        match job.retries {
            Some(retries) => retries.saturating_add(1),
            None => self.max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }

    #[test]
    fn exponential_backoff_doubles() {
        let policy = policy();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4_000));
    }

    #[test]
    fn respects_max_delay() {
        let policy = RetryPolicy {
            max_delay_ms: 5_000,
            ..policy()
        };
        assert_eq!(policy.delay_for(10), Duration::from_millis(5_000));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(5_000));
    }

    #[test]
    fn exhaustion_after_max_attempts() {
        let policy = policy();
        assert!(policy.should_retry(1, 2));
        assert!(!policy.should_retry(2, 2));
    }

    #[test]
    fn job_retries_override_default() {
        let policy = policy();
        let mut job = Job::new("j", "j", "m", "run.sh");
        assert_eq!(policy.max_attempts_for(&job), 3);
        job.retries = Some(0);
        assert_eq!(policy.max_attempts_for(&job), 1);
        job.retries = Some(4);
        assert_eq!(policy.max_attempts_for(&job), 5);
    }

    #[test]
    fn built_from_config() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for(1), Duration::from_millis(2_000));
    }
}
