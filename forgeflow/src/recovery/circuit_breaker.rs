//! Per-kind circuit breaker.
//!
//! Three states: closed (attempts allowed), open (attempts blocked until the
//! recovery timeout elapses) and half-open (a limited number of trial
//! attempts). Breakers are plain values; the engine keeps one per kind in a
//! concurrent map and passes the current instant in, which keeps state
//! changes atomic under the map's shard lock.

use crate::config::CircuitBreakerConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    #[default]
    Closed,
    /// Failing fast.
    Open,
    /// Admitting trial attempts.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// How an attempt was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The breaker was closed.
    Closed,
    /// A trial of the given half-open window.
    Trial(u64),
}

/// Serializable view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitStatus {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures while closed.
    pub failure_count: u32,
    /// Trial attempts admitted in the current half-open window.
    pub half_open_calls: u32,
    /// Successful trials in the current half-open window.
    pub half_open_successes: u32,
    /// Seconds since the last failure.
    pub secs_since_last_failure: Option<f64>,
}

/// Breaker for one work-unit kind.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    kind: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_max_calls: u32,
    state: CircuitState,
    failure_count: u32,
    half_open_calls: u32,
    half_open_successes: u32,
    /// Counts half-open windows so a late release cannot touch a newer one.
    window: u64,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(kind: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            kind: kind.into(),
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: config.recovery_timeout(),
            half_open_max_calls: config.half_open_max_calls.max(1),
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_calls: 0,
            half_open_successes: 0,
            window: 0,
            last_failure: None,
            opened_at: None,
        }
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// The kind this breaker guards.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    fn cooled_down(&self, now: Instant) -> bool {
        self.opened_at
            .map_or(true, |opened| now.saturating_duration_since(opened) >= self.recovery_timeout)
    }

    /// Whether an attempt would be admitted at `now`, without consuming a
    /// half-open trial.
    #[must_use]
    pub fn allows(&self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.cooled_down(now),
            CircuitState::HalfOpen => self.half_open_calls < self.half_open_max_calls,
        }
    }

    /// Admits an attempt at `now`, moving open to half-open after the cool
    /// down and counting half-open trials.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.admit(now).is_some()
    }

    /// Like [`try_acquire`](Self::try_acquire), but reports whether the
    /// attempt took a half-open trial. A trial whose attempt never reports
    /// must be handed back with [`release_trial`](Self::release_trial).
    pub fn admit(&mut self, now: Instant) -> Option<Admission> {
        if self.state == CircuitState::Open {
            if !self.cooled_down(now) {
                return None;
            }
            info!(kind = %self.kind, "Circuit breaker half-open");
            self.state = CircuitState::HalfOpen;
            self.half_open_calls = 0;
            self.half_open_successes = 0;
            self.window += 1;
        }
        match self.state {
            CircuitState::Closed => Some(Admission::Closed),
            CircuitState::HalfOpen if self.half_open_calls < self.half_open_max_calls => {
                self.half_open_calls += 1;
                Some(Admission::Trial(self.window))
            }
            _ => None,
        }
    }

    /// Hands back a trial whose attempt was abandoned without an outcome.
    /// Returns false when the trial's window has already ended.
    pub fn release_trial(&mut self, window: u64) -> bool {
        let current = self.state == CircuitState::HalfOpen && self.window == window;
        if !current || self.half_open_calls == 0 {
            return false;
        }
        self.half_open_calls -= 1;
        debug!(kind = %self.kind, "Half-open trial released");
        true
    }

    /// Records a successful attempt.
    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.half_open_max_calls {
                    info!(kind = %self.kind, "Circuit breaker closed");
                    self.close();
                }
            }
            CircuitState::Closed => self.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    /// Records a failed attempt at `now`.
    pub fn record_failure(&mut self, now: Instant) {
        self.last_failure = Some(now);
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    warn!(
                        kind = %self.kind,
                        failures = self.failure_count,
                        "Circuit breaker opened"
                    );
                    self.open(now);
                }
            }
            CircuitState::HalfOpen => {
                warn!(kind = %self.kind, "Circuit breaker reopened after half-open failure");
                self.open(now);
            }
            CircuitState::Open => {}
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.half_open_calls = 0;
        self.half_open_successes = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.half_open_calls = 0;
        self.half_open_successes = 0;
        self.opened_at = None;
    }

    /// Forces the breaker closed.
    pub fn reset(&mut self) {
        self.close();
        self.last_failure = None;
    }

    /// Serializable snapshot at `now`.
    #[must_use]
    pub fn status(&self, now: Instant) -> CircuitStatus {
        CircuitStatus {
            state: self.state,
            failure_count: self.failure_count,
            half_open_calls: self.half_open_calls,
            half_open_successes: self.half_open_successes,
            secs_since_last_failure: self
                .last_failure
                .map(|t| now.saturating_duration_since(t).as_secs_f64()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "coder",
            &CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_timeout_secs: 10.0,
                half_open_max_calls: 2,
            },
        )
    }

    #[test]
    fn test_opens_after_threshold() {
        let mut cb = breaker();
        let now = Instant::now();
        cb.record_failure(now);
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allows(now));
        assert!(!cb.try_acquire(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let mut cb = breaker();
        let now = Instant::now();
        cb.record_failure(now);
        cb.record_failure(now);
        cb.record_success();
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.status(now).failure_count, 1);
    }

    #[test]
    fn test_half_open_admits_limited_trials_then_closes() {
        let mut cb = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            cb.record_failure(now);
        }
        let later = now + Duration::from_secs(10);
        assert!(cb.allows(later));
        assert!(cb.try_acquire(later));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire(later));
        assert!(!cb.try_acquire(later));

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire(later));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let mut cb = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            cb.record_failure(now);
        }
        let later = now + Duration::from_secs(11);
        assert!(cb.try_acquire(later));
        cb.record_failure(later);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allows(later + Duration::from_secs(1)));
    }

    #[test]
    fn test_released_trial_is_admitted_again() {
        let mut cb = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            cb.record_failure(now);
        }
        let later = now + Duration::from_secs(10);
        let first = cb.admit(later);
        assert!(matches!(first, Some(Admission::Trial(_))));
        assert!(cb.try_acquire(later));
        assert!(!cb.allows(later));

        let Some(Admission::Trial(window)) = first else {
            unreachable!()
        };
        assert!(cb.release_trial(window));
        assert_eq!(cb.status(later).half_open_calls, 1);
        assert!(cb.allows(later));
        assert!(cb.try_acquire(later));
    }

    #[test]
    fn test_stale_trial_release_is_ignored() {
        let mut cb = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            cb.record_failure(now);
        }
        let later = now + Duration::from_secs(10);
        let Some(Admission::Trial(old_window)) = cb.admit(later) else {
            panic!("expected a half-open trial");
        };
        cb.record_failure(later);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.release_trial(old_window));

        let much_later = later + Duration::from_secs(10);
        assert!(matches!(cb.admit(much_later), Some(Admission::Trial(w)) if w != old_window));
        assert!(!cb.release_trial(old_window));
        assert_eq!(cb.status(much_later).half_open_calls, 1);
    }

    #[test]
    fn test_closed_admission() {
        let mut cb = breaker();
        assert_eq!(cb.admit(Instant::now()), Some(Admission::Closed));
        assert!(!cb.release_trial(0));
    }

    #[test]
    fn test_reset() {
        let mut cb = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            cb.record_failure(now);
        }
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.status(now).secs_since_last_failure.is_none());
    }
}
