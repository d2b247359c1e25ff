//! Retry delay computation with configurable jitter.

use crate::config::OrchestrationConfig;
use crate::core::RetryStrategy;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Jitter applied on top of the computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// The computed delay exactly.
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

/// Delay parameters shared by every retry strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 300_000,
            jitter: JitterStrategy::None,
        }
    }
}

impl RetryPolicy {
    /// Policy taken from the engine configuration.
    #[must_use]
    pub fn from_config(config: &OrchestrationConfig) -> Self {
        Self {
            base_delay_ms: config.retry_base_delay_ms,
            max_delay_ms: config.retry_max_delay_ms,
            jitter: config.retry_jitter,
        }
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before `attempt` (1-based, the attempt that just failed) is
    /// retried, before jitter.
    #[must_use]
    pub fn base_delay(&self, strategy: RetryStrategy, attempt: u32) -> u64 {
        let base = self.base_delay_ms;
        let attempt = attempt.max(1);
        let delay = match strategy {
            RetryStrategy::None | RetryStrategy::Immediate => 0,
            RetryStrategy::ExponentialBackoff => {
                base.saturating_mul(2u64.saturating_pow(attempt - 1))
            }
            RetryStrategy::LinearBackoff => base.saturating_mul(u64::from(attempt)),
            RetryStrategy::FixedDelay => base,
        };
        delay.min(self.max_delay_ms)
    }
}

/// Jitter state across retries; decorrelated jitter remembers the previous
/// delay per key.
#[derive(Debug, Default)]
pub struct BackoffState {
    previous_delays: HashMap<String, u64>,
}

impl BackoffState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes the jittered delay for `key`.
    pub fn delay(
        &mut self,
        key: &str,
        policy: &RetryPolicy,
        strategy: RetryStrategy,
        attempt: u32,
    ) -> Duration {
        let delay = policy.base_delay(strategy, attempt);
        if delay == 0 {
            return Duration::ZERO;
        }
        let jittered = match policy.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => rand::thread_rng().gen_range(0..=delay),
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let base = policy.base_delay_ms.min(policy.max_delay_ms);
                let prev = self.previous_delays.get(key).copied().unwrap_or(base);
                let upper = prev.saturating_mul(3).min(policy.max_delay_ms);
                let next = if upper <= base {
                    base
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                };
                self.previous_delays.insert(key.to_string(), next);
                next
            }
        };
        Duration::from_millis(jittered)
    }

    /// Forgets the state for `key`.
    pub fn forget(&mut self, key: &str) {
        self.previous_delays.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::default().with_base_delay_ms(100).with_max_delay_ms(1000)
    }

    #[test]
    fn test_jitter_default_is_none() {
        assert_eq!(JitterStrategy::default(), JitterStrategy::None);
    }

    #[test]
    fn test_exponential() {
        let p = policy();
        assert_eq!(p.base_delay(RetryStrategy::ExponentialBackoff, 1), 100);
        assert_eq!(p.base_delay(RetryStrategy::ExponentialBackoff, 2), 200);
        assert_eq!(p.base_delay(RetryStrategy::ExponentialBackoff, 3), 400);
        // capped
        assert_eq!(p.base_delay(RetryStrategy::ExponentialBackoff, 10), 1000);
    }

    #[test]
    fn test_linear_fixed_immediate() {
        let p = policy();
        assert_eq!(p.base_delay(RetryStrategy::LinearBackoff, 3), 300);
        assert_eq!(p.base_delay(RetryStrategy::FixedDelay, 7), 100);
        assert_eq!(p.base_delay(RetryStrategy::Immediate, 4), 0);
        assert_eq!(p.base_delay(RetryStrategy::None, 4), 0);
    }

    #[test]
    fn test_no_jitter_is_exact() {
        let mut state = BackoffState::new();
        let delay = state.delay("k", &policy(), RetryStrategy::LinearBackoff, 2);
        assert_eq!(delay, Duration::from_millis(200));
    }

    #[test]
    fn test_full_jitter_bounded() {
        let mut state = BackoffState::new();
        let p = policy().with_jitter(JitterStrategy::Full);
        for _ in 0..20 {
            assert!(state.delay("k", &p, RetryStrategy::FixedDelay, 1) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_decorrelated_jitter_bounded() {
        let mut state = BackoffState::new();
        let p = policy().with_jitter(JitterStrategy::Decorrelated);
        for attempt in 1..10 {
            let d = state.delay("k", &p, RetryStrategy::ExponentialBackoff, attempt);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(1000));
        }
        state.forget("k");
    }
}
