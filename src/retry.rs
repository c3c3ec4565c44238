//! Exponential backoff between retry attempts.
//!
//! The delay before retry `n` (zero-based count of retries already made) is
//! `min(base * 2^n, cap)`. Optional jitter spreads retries of many failing
//! jobs apart; the jittered delay is clamped to the cap again.
//!
//! ```rust
//! use jobmill::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
//! assert_eq!(policy.delay_for(0), Duration::from_secs(1));
//! assert_eq!(policy.delay_for(3), Duration::from_secs(8));
//! assert_eq!(policy.delay_for(10), Duration::from_secs(60));
//! ```

use crate::config::JobConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Randomness applied to a computed delay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JitterType {
    /// `delay ± rand(0, amount)`, never below zero.
    Additive(Duration),
    /// `delay * rand(1 - factor, 1 + factor)`.
    Multiplicative(f64),
}

impl JitterType {
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();

        match self {
            JitterType::Additive(amount) => {
                let jitter = Duration::from_millis(rng.gen_range(0..=amount.as_millis() as u64));
                if rng.gen_bool(0.5) {
                    delay + jitter
                } else {
                    delay.saturating_sub(jitter)
                }
            }
            JitterType::Multiplicative(factor) => {
                let factor = factor.clamp(0.0, 1.0);
                let scale = rng.gen_range((1.0 - factor)..=(1.0 + factor));
                Duration::from_millis((delay.as_millis() as f64 * scale) as u64)
            }
        }
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<JitterType>,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: None,
        }
    }

    pub fn from_config(config: &JobConfig) -> Self {
        Self {
            base_delay: config.retry_delay,
            max_delay: config.max_retry_delay,
            jitter: config.retry_jitter.clone(),
        }
    }

    pub fn with_jitter(mut self, jitter: JitterType) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Deterministic delay before the retry that follows `retry_count` earlier retries.
    pub fn base_delay_for(&self, retry_count: u32) -> Duration {
        if retry_count >= 32 {
            return self.max_delay;
        }
        self.base_delay
            .checked_mul(1u32 << retry_count)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Delay to wait, with jitter applied if configured.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let delay = self.base_delay_for(retry_count);
        match &self.jitter {
            Some(jitter) => jitter.apply(delay).min(self.max_delay),
            None => delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&JobConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(1));

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let policy = RetryPolicy::new(Duration::from_millis(250), Duration::from_secs(300));
        let mut previous = Duration::ZERO;

        for n in 0..100 {
            let delay = policy.delay_for(n);
            assert!(delay >= previous, "delay({}) decreased", n);
            assert!(delay <= policy.max_delay);
            previous = delay;
        }
    }

    #[test]
    fn test_large_retry_counts_do_not_overflow() {
        let policy = RetryPolicy::new(Duration::from_secs(u64::MAX / 4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_additive_jitter_bounds() {
        let jitter = JitterType::Additive(Duration::from_secs(2));
        for _ in 0..50 {
            let delay = jitter.apply(Duration::from_secs(10));
            assert!(delay >= Duration::from_secs(8));
            assert!(delay <= Duration::from_secs(12));
        }
    }

    #[test]
    fn test_jittered_delay_never_exceeds_cap() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(4))
            .with_jitter(JitterType::Multiplicative(0.5));

        for _ in 0..50 {
            assert!(policy.delay_for(5) <= Duration::from_secs(4));
            let first = policy.delay_for(0);
            assert!(first >= Duration::from_millis(500));
            assert!(first <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_from_config() {
        let config = JobConfig {
            retry_delay: Duration::from_millis(50),
            max_retry_delay: Duration::from_secs(2),
            ..JobConfig::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.base_delay, Duration::from_millis(50));
        assert_eq!(policy.max_delay, Duration::from_secs(2));
        assert!(policy.jitter.is_none());
    }
}
