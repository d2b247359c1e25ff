//! Per-run counters derived from observed execution state.

use crate::core::{ExecutionStatus, PipelineRun};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;
use uuid::Uuid;

/// Terminal outcomes of one kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindErrorRate {
    /// Executions of the kind that reached a terminal outcome.
    pub total: u64,
    /// Of those, the ones that failed.
    pub failed: u64,
}

impl KindErrorRate {
    /// Failed share as a percentage.
    #[must_use]
    pub fn rate_percent(&self) -> f64 {
        percent(self.failed, self.total)
    }
}

/// Immutable aggregate of a run's counters at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Snapshot time.
    pub timestamp: DateTime<Utc>,
    /// Attempts observed starting.
    pub executions_started: u64,
    /// Executions observed succeeding.
    pub executions_completed: u64,
    /// Executions observed failing terminally.
    pub executions_failed: u64,
    /// Retries observed.
    pub retry_count: u64,
    /// Sum of durations of succeeded executions.
    pub total_execution_time_secs: f64,
    /// Mean duration of succeeded executions.
    pub average_execution_time_secs: f64,
    /// Completions per minute since collection started.
    pub throughput_per_minute: f64,
    /// Completed / started, percent.
    pub success_rate: f64,
    /// Failed / started, percent.
    pub failure_rate: f64,
    /// Retries / started, percent.
    pub retry_rate: f64,
    /// Terminal outcomes per kind.
    pub error_rates: BTreeMap<String, KindErrorRate>,
    /// Seconds since collection started.
    pub monitoring_duration_secs: f64,
}

/// Accumulates counters for one run.
///
/// The collector only ever reads the run. What it has already counted is
/// kept in its own id sets, so observing the same state twice never
/// double-counts.
#[derive(Debug, Clone)]
pub struct MetricCollector {
    started_at: DateTime<Utc>,
    executions_started: u64,
    executions_completed: u64,
    executions_failed: u64,
    retry_count: u64,
    total_execution_time_secs: f64,
    error_rates: BTreeMap<String, KindErrorRate>,
    recorded_starts: HashSet<(Uuid, u32)>,
    recorded_retries: HashSet<(Uuid, u32)>,
    recorded_completions: HashSet<Uuid>,
    recorded_failures: HashSet<Uuid>,
}

impl Default for MetricCollector {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl MetricCollector {
    /// Creates a collector whose throughput window opens at `started_at`.
    #[must_use]
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            executions_started: 0,
            executions_completed: 0,
            executions_failed: 0,
            retry_count: 0,
            total_execution_time_secs: 0.0,
            error_rates: BTreeMap::new(),
            recorded_starts: HashSet::new(),
            recorded_retries: HashSet::new(),
            recorded_completions: HashSet::new(),
            recorded_failures: HashSet::new(),
        }
    }

    /// Records every state change visible in `run` that has not been
    /// counted yet.
    pub fn observe(&mut self, run: &PipelineRun) {
        for exec in &run.executions {
            // Every attempt before the current one was started and then
            // retried; the current one counts once it has a start time.
            let started_through = if exec.started_at.is_some() {
                exec.attempt_number
            } else {
                exec.attempt_number.saturating_sub(1)
            };
            for attempt in 1..=started_through {
                if self.recorded_starts.insert((exec.id, attempt)) {
                    self.executions_started += 1;
                }
            }
            for attempt in 2..=exec.attempt_number {
                if self.recorded_retries.insert((exec.id, attempt)) {
                    self.retry_count += 1;
                    debug!(execution_id = %exec.id, kind = %exec.kind, attempt, "Retry recorded");
                }
            }

            match exec.status {
                ExecutionStatus::Success if self.recorded_completions.insert(exec.id) => {
                    self.executions_completed += 1;
                    self.total_execution_time_secs += exec.duration_secs.unwrap_or(0.0);
                    self.error_rates.entry(exec.kind.clone()).or_default().total += 1;
                    debug!(execution_id = %exec.id, kind = %exec.kind, "Completion recorded");
                }
                ExecutionStatus::Failure if self.recorded_failures.insert(exec.id) => {
                    self.executions_failed += 1;
                    let rate = self.error_rates.entry(exec.kind.clone()).or_default();
                    rate.total += 1;
                    rate.failed += 1;
                    debug!(
                        execution_id = %exec.id,
                        kind = %exec.kind,
                        error = ?exec.last_error,
                        "Failure recorded"
                    );
                }
                _ => {}
            }
        }
    }

    /// Builds a snapshot as of `now`.
    #[must_use]
    pub fn snapshot(&self, now: DateTime<Utc>) -> MetricsSnapshot {
        let monitoring_duration_secs =
            ((now - self.started_at).num_milliseconds() as f64 / 1000.0).max(0.0);
        let minutes = monitoring_duration_secs / 60.0;
        let throughput_per_minute = if minutes > 0.0 {
            self.executions_completed as f64 / minutes
        } else {
            0.0
        };
        let average_execution_time_secs = if self.executions_completed == 0 {
            0.0
        } else {
            self.total_execution_time_secs / self.executions_completed as f64
        };
        MetricsSnapshot {
            timestamp: now,
            executions_started: self.executions_started,
            executions_completed: self.executions_completed,
            executions_failed: self.executions_failed,
            retry_count: self.retry_count,
            total_execution_time_secs: self.total_execution_time_secs,
            average_execution_time_secs,
            throughput_per_minute,
            success_rate: percent(self.executions_completed, self.executions_started),
            failure_rate: percent(self.executions_failed, self.executions_started),
            retry_rate: percent(self.retry_count, self.executions_started),
            error_rates: self.error_rates.clone(),
            monitoring_duration_secs,
        }
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}
