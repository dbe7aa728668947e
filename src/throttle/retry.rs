// src/throttle/retry.rs

//! Retry schedule with exponential backoff and jitter.

use std::time::Duration;

use crate::models::RetryConfig;

/// Attempt budget and delay curve for one class of calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn single() -> Self {
        Self {
            max_attempts: 1,
            ..Self::from(RetryConfig::default())
        }
    }

    pub fn with_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }

    pub fn without_jitter(self) -> Self {
        Self {
            jitter: false,
            ..self
        }
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// `base * multiplier^attempt`, capped at `max`, then +/- 50% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let scale = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let seconds = (self.base.as_secs_f64() * scale).min(self.max.as_secs_f64());
        let delay = Duration::from_secs_f64(seconds.max(0.0));

        if !self.jitter {
            return delay;
        }
        let half = (delay.as_millis() as f64 * 0.5) as u64;
        let offset = fastrand::u64(0..=(half * 2));
        let total = delay.as_millis() as i64 + offset as i64 - half as i64;
        Duration::from_millis(total.max(0) as u64)
    }

    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_millis(500),
            jitter: false,
        }
    }

    #[test]
    fn exponential_growth_is_capped() {
        let p = policy();
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(1), Duration::from_millis(200));
        assert_eq!(p.delay(2), Duration::from_millis(400));
        assert_eq!(p.delay(3), Duration::from_millis(500));
        assert_eq!(p.delay(30), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_half_either_side() {
        let p = RetryPolicy {
            jitter: true,
            ..policy()
        };
        for _ in 0..200 {
            let d = p.delay(1).as_millis();
            assert!((100..=300).contains(&d), "{d}");
        }
    }

    #[test]
    fn attempt_budget() {
        let p = policy();
        assert!(p.allows_retry(0));
        assert!(p.allows_retry(2));
        assert!(!p.allows_retry(3));
        assert!(!RetryPolicy::single().allows_retry(0));
    }
}
