//! Threshold alerts.

use super::MetricsSnapshot;
use crate::config::AlertThresholds;
use crate::core::{ExecutionStatus, PipelineRun, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// What an alert reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Failure rate above threshold.
    HighFailureRate,
    /// Retry rate above threshold.
    HighRetryRate,
    /// An execution is running well past its timeout.
    LongRunningExecution,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HighFailureRate => write!(f, "high_failure_rate"),
            Self::HighRetryRate => write!(f, "high_retry_rate"),
            Self::LongRunningExecution => write!(f, "long_running_execution"),
        }
    }
}

/// A raised alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Alert kind.
    pub kind: AlertKind,
    /// Severity.
    pub severity: Severity,
    /// Human-readable message.
    pub message: String,
    /// Owning run.
    pub run_id: Uuid,
    /// Execution concerned, for per-execution alerts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    /// Observed value.
    pub value: f64,
    /// Threshold crossed.
    pub threshold: f64,
    /// When the alert was raised.
    pub timestamp: DateTime<Utc>,
}

/// Evaluates thresholds for one run.
///
/// Rate alerts fire when the rate crosses its threshold and re-arm once it
/// drops back below. A long-running alert fires once per attempt.
#[derive(Debug, Clone)]
pub struct AlertManager {
    thresholds: AlertThresholds,
    runtime_limit_secs: f64,
    raised_rates: HashSet<AlertKind>,
    warned_attempts: HashSet<(Uuid, u32)>,
}

impl AlertManager {
    /// Creates a manager; runtime alerts trigger after
    /// `execution_timeout_secs * execution_runtime_factor`.
    #[must_use]
    pub fn new(thresholds: AlertThresholds, execution_timeout_secs: f64) -> Self {
        let runtime_limit_secs = execution_timeout_secs * thresholds.execution_runtime_factor;
        Self {
            thresholds,
            runtime_limit_secs,
            raised_rates: HashSet::new(),
            warned_attempts: HashSet::new(),
        }
    }

    /// Returns the alerts newly raised by this observation.
    pub fn check(
        &mut self,
        run: &PipelineRun,
        metrics: &MetricsSnapshot,
        now: DateTime<Utc>,
    ) -> Vec<Alert> {
        let mut alerts = Vec::new();

        let failure_threshold = self.thresholds.failure_rate_percent;
        if self.rate_crossed(AlertKind::HighFailureRate, metrics.failure_rate, failure_threshold) {
            alerts.push(Alert {
                kind: AlertKind::HighFailureRate,
                severity: Severity::High,
                message: format!("High failure rate detected: {:.1}%", metrics.failure_rate),
                run_id: run.id,
                execution_id: None,
                value: metrics.failure_rate,
                threshold: failure_threshold,
                timestamp: now,
            });
        }

        let retry_threshold = self.thresholds.retry_rate_percent;
        if self.rate_crossed(AlertKind::HighRetryRate, metrics.retry_rate, retry_threshold) {
            alerts.push(Alert {
                kind: AlertKind::HighRetryRate,
                severity: Severity::Medium,
                message: format!("High retry rate detected: {:.1}%", metrics.retry_rate),
                run_id: run.id,
                execution_id: None,
                value: metrics.retry_rate,
                threshold: retry_threshold,
                timestamp: now,
            });
        }

        for exec in &run.executions {
            if exec.status != ExecutionStatus::Running {
                continue;
            }
            let Some(started) = exec.started_at else {
                continue;
            };
            let running_secs = (now - started).num_milliseconds() as f64 / 1000.0;
            if running_secs > self.runtime_limit_secs
                && self.warned_attempts.insert((exec.id, exec.attempt_number))
            {
                alerts.push(Alert {
                    kind: AlertKind::LongRunningExecution,
                    severity: Severity::Medium,
                    message: format!("Execution {} running longer than expected", exec.kind),
                    run_id: run.id,
                    execution_id: Some(exec.id),
                    value: running_secs,
                    threshold: self.runtime_limit_secs,
                    timestamp: now,
                });
            }
        }

        alerts
    }

    fn rate_crossed(&mut self, kind: AlertKind, value: f64, threshold: f64) -> bool {
        if value > threshold {
            self.raised_rates.insert(kind)
        } else {
            self.raised_rates.remove(&kind);
            false
        }
    }
}
