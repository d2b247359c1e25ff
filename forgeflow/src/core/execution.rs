//! Attempt-tracked work-unit execution record.

use super::{ExecutionStatus, RetryStrategy, WorkOutput};
use crate::errors::{OrchestrationError, Result};
use crate::recovery::RecoveryStrategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Default scheduling priority.
pub const DEFAULT_PRIORITY: u8 = 50;

/// Estimated duration assumed for critical-path analysis when none is given.
pub const DEFAULT_ESTIMATED_DURATION_SECS: f64 = 60.0;

/// Resource costs claimed by an execution while it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// CPU units in percent of one host.
    #[serde(default = "default_cpu")]
    pub cpu: f64,
    /// Memory in megabytes.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: f64,
    /// Other named costs, carried for handlers and reporting.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, f64>,
}

fn default_cpu() -> f64 {
    25.0
}

fn default_memory_mb() -> f64 {
    512.0
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            memory_mb: default_memory_mb(),
            extra: HashMap::new(),
        }
    }
}

impl ResourceRequirements {
    /// Creates requirements with explicit cpu and memory costs.
    #[must_use]
    pub fn new(cpu: f64, memory_mb: f64) -> Self {
        Self {
            cpu,
            memory_mb,
            extra: HashMap::new(),
        }
    }

    /// Adds a named cost.
    #[must_use]
    pub fn with_extra(mut self, name: impl Into<String>, value: f64) -> Self {
        self.extra.insert(name.into(), value);
        self
    }

    /// Combined cost used by resource-aware scheduling.
    #[must_use]
    pub fn weighted_cost(&self) -> f64 {
        self.cpu + self.memory_mb / 100.0
    }
}

/// One finished attempt that did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Attempt number (1-based).
    pub attempt: u32,
    /// How the attempt ended.
    pub status: ExecutionStatus,
    /// The error text.
    pub error: String,
    /// When the attempt ended.
    pub finished_at: DateTime<Utc>,
}

/// A work unit within a pipeline run, tracked across attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnitExecution {
    /// Unique execution id.
    pub id: Uuid,
    /// Owning run.
    pub run_id: Uuid,
    /// Work-unit kind, unique within the run.
    pub kind: String,
    /// Current status.
    pub status: ExecutionStatus,
    /// Current attempt number (1-based).
    pub attempt_number: u32,
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Delay policy between attempts.
    pub retry_strategy: RetryStrategy,
    /// Kinds that must succeed before this unit may start.
    pub depends_on: Vec<String>,
    /// Scheduling priority (1-100).
    pub priority: u8,
    /// Resources claimed while running.
    pub resource_requirements: ResourceRequirements,
    /// Expected run time in seconds.
    pub estimated_duration_secs: Option<f64>,
    /// Handler configuration for this unit.
    #[serde(default)]
    pub configuration: HashMap<String, Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Start of the current attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// End of the last attempt.
    pub completed_at: Option<DateTime<Utc>>,
    /// Duration of the last attempt in seconds.
    pub duration_secs: Option<f64>,
    /// Error of the most recent failed attempt.
    pub last_error: Option<String>,
    /// Output once successful.
    pub output: Option<WorkOutput>,
    /// The last recovery strategy applied to this execution.
    pub recovery_strategy: Option<RecoveryStrategy>,
    /// Failed attempts, oldest first.
    #[serde(default)]
    pub failure_history: Vec<AttemptRecord>,
}

impl WorkUnitExecution {
    /// Creates a pending execution with default settings.
    #[must_use]
    pub fn new(run_id: Uuid, kind: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            kind: kind.into(),
            status: ExecutionStatus::Pending,
            attempt_number: 1,
            max_attempts: 3,
            retry_strategy: RetryStrategy::default(),
            depends_on: Vec::new(),
            priority: DEFAULT_PRIORITY,
            resource_requirements: ResourceRequirements::default(),
            estimated_duration_secs: None,
            configuration: HashMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_secs: None,
            last_error: None,
            output: None,
            recovery_strategy: None,
            failure_history: Vec::new(),
        }
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the priority, clamped to 1..=100.
    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 100);
        self
    }

    /// Sets the maximum number of attempts (at least one).
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets the retry strategy.
    #[must_use]
    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = strategy;
        self
    }

    /// Sets the resource requirements.
    #[must_use]
    pub fn with_resources(mut self, requirements: ResourceRequirements) -> Self {
        self.resource_requirements = requirements;
        self
    }

    /// Sets the estimated duration.
    #[must_use]
    pub fn with_estimated_duration(mut self, secs: f64) -> Self {
        self.estimated_duration_secs = Some(secs);
        self
    }

    /// Sets the handler configuration.
    #[must_use]
    pub fn with_configuration(mut self, configuration: HashMap<String, Value>) -> Self {
        self.configuration = configuration;
        self
    }

    /// Returns the estimated duration or the default.
    #[must_use]
    pub fn estimated_duration_or_default(&self) -> f64 {
        self.estimated_duration_secs
            .unwrap_or(DEFAULT_ESTIMATED_DURATION_SECS)
    }

    /// Returns true if every dependency is in `succeeded`.
    #[must_use]
    pub fn dependencies_satisfied(&self, succeeded: &HashSet<&str>) -> bool {
        self.depends_on.iter().all(|d| succeeded.contains(d.as_str()))
    }

    /// Moves to `next`, rejecting transitions outside the state machine.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestrationError::InvalidTransition {
                execution_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Starts the current attempt.
    pub fn mark_started(&mut self) -> Result<()> {
        self.transition(ExecutionStatus::Running)?;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        self.duration_secs = None;
        Ok(())
    }

    /// Records a successful attempt.
    pub fn mark_completed(&mut self, output: WorkOutput) -> Result<()> {
        self.transition(ExecutionStatus::Success)?;
        self.output = Some(output);
        self.last_error = None;
        self.finish_timing();
        Ok(())
    }

    /// Records a failed attempt.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<()> {
        self.end_attempt(ExecutionStatus::Failure, error.into())
    }

    /// Records an attempt that exceeded its timeout.
    pub fn mark_timed_out(&mut self, error: impl Into<String>) -> Result<()> {
        self.end_attempt(ExecutionStatus::Timeout, error.into())
    }

    fn end_attempt(&mut self, status: ExecutionStatus, error: String) -> Result<()> {
        self.transition(status)?;
        self.finish_timing();
        self.failure_history.push(AttemptRecord {
            attempt: self.attempt_number,
            status,
            error: error.clone(),
            finished_at: Utc::now(),
        });
        self.last_error = Some(error);
        Ok(())
    }

    fn finish_timing(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration_secs = self
            .started_at
            .map(|start| (now - start).num_milliseconds() as f64 / 1000.0);
    }

    /// Returns true if another attempt may be made.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.attempt_number < self.max_attempts
            && self.status.is_failed_attempt()
            && self.retry_strategy != RetryStrategy::None
    }

    /// Re-enters `Pending` through `Retry` for the next attempt.
    ///
    /// Returns false and leaves the execution untouched when no attempts remain.
    pub fn prepare_retry(&mut self) -> Result<bool> {
        if !self.can_retry() {
            return Ok(false);
        }
        self.transition(ExecutionStatus::Retry)?;
        self.attempt_number += 1;
        self.transition(ExecutionStatus::Pending)?;
        self.started_at = None;
        self.completed_at = None;
        self.duration_secs = None;
        Ok(true)
    }

    /// Records a substitute success (skip placeholder or fallback output)
    /// for a failed attempt.
    pub fn substitute_success(&mut self, output: WorkOutput) -> Result<()> {
        self.transition(ExecutionStatus::Success)?;
        self.output = Some(output);
        if self.completed_at.is_none() {
            self.finish_timing();
        }
        Ok(())
    }

    /// Marks the attempt as terminally failed, keeping the last error.
    pub fn mark_terminal_failure(&mut self, error: Option<String>) -> Result<()> {
        if self.status != ExecutionStatus::Failure {
            self.transition(ExecutionStatus::Failure)?;
        }
        if let Some(error) = error {
            self.last_error = Some(error);
        }
        Ok(())
    }

    /// Invalidates a succeeded execution after a late failure report.
    pub fn invalidate(&mut self, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        self.transition(ExecutionStatus::Failure)?;
        self.output = None;
        self.failure_history.push(AttemptRecord {
            attempt: self.attempt_number,
            status: ExecutionStatus::Failure,
            error: error.clone(),
            finished_at: Utc::now(),
        });
        self.last_error = Some(error);
        Ok(())
    }

    /// Resets a succeeded execution whose inputs were rolled back.
    pub fn reset_for_rollback(&mut self) -> Result<()> {
        self.transition(ExecutionStatus::Pending)?;
        self.output = None;
        self.started_at = None;
        self.completed_at = None;
        self.duration_secs = None;
        Ok(())
    }

    /// Cancels the execution unless it is already terminal.
    ///
    /// Returns true if the status changed.
    pub fn cancel(&mut self, reason: impl Into<String>) -> bool {
        if self.status.is_terminal() || !self.status.can_transition_to(ExecutionStatus::Cancelled) {
            return false;
        }
        self.status = ExecutionStatus::Cancelled;
        self.last_error = Some(reason.into());
        if self.started_at.is_some() && self.completed_at.is_none() {
            self.finish_timing();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn execution() -> WorkUnitExecution {
        WorkUnitExecution::new(Uuid::new_v4(), "coder").with_max_attempts(2)
    }

    #[test]
    fn test_defaults() {
        let exec = WorkUnitExecution::new(Uuid::new_v4(), "planner");
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert_eq!(exec.attempt_number, 1);
        assert_eq!(exec.priority, DEFAULT_PRIORITY);
        assert!((exec.resource_requirements.cpu - 25.0).abs() < f64::EPSILON);
        assert!((exec.estimated_duration_or_default() - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_success_path() {
        let mut exec = execution();
        exec.mark_started().unwrap();
        exec.mark_completed(WorkOutput::new(json!("done"))).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Success);
        assert!(exec.duration_secs.is_some());
        assert_eq!(exec.output.unwrap().result, json!("done"));
    }

    #[test]
    fn test_retry_bounded_by_max_attempts() {
        let mut exec = execution();
        exec.mark_started().unwrap();
        exec.mark_failed("boom").unwrap();
        assert!(exec.prepare_retry().unwrap());
        assert_eq!(exec.attempt_number, 2);
        assert_eq!(exec.status, ExecutionStatus::Pending);

        exec.mark_started().unwrap();
        exec.mark_timed_out("Execution timeout after 1.0s").unwrap();
        assert!(!exec.can_retry());
        assert!(!exec.prepare_retry().unwrap());
        assert_eq!(exec.attempt_number, 2);
        assert_eq!(exec.failure_history.len(), 2);
    }

    #[test]
    fn test_no_retry_strategy_never_retries() {
        let mut exec = execution().with_retry_strategy(RetryStrategy::None);
        exec.mark_started().unwrap();
        exec.mark_failed("boom").unwrap();
        assert!(!exec.can_retry());
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut exec = execution();
        let err = exec.mark_completed(WorkOutput::default()).unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidTransition { .. }));
    }

    #[test]
    fn test_rollback_clears_output() {
        let mut exec = execution();
        exec.mark_started().unwrap();
        exec.mark_completed(WorkOutput::new(json!(1))).unwrap();
        exec.reset_for_rollback().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert!(exec.output.is_none());
        assert!(exec.completed_at.is_none());
    }

    #[test]
    fn test_cancel_only_non_terminal() {
        let mut exec = execution();
        assert!(exec.cancel("stop"));
        assert!(!exec.cancel("again"));
        assert_eq!(exec.last_error.as_deref(), Some("stop"));
    }
}
