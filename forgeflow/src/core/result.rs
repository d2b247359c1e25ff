//! Immutable result of a finished run.

use super::{ExecutionStatus, PipelineRun, PipelineStatus, WorkOutput};
use crate::recovery::RecoveryStrategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Per-execution detail included in a run result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionSummary {
    /// Execution id.
    pub id: Uuid,
    /// Work-unit kind.
    pub kind: String,
    /// Final status.
    pub status: ExecutionStatus,
    /// Attempts made.
    pub attempts: u32,
    /// Error of the last failed attempt.
    pub last_error: Option<String>,
    /// Last recovery strategy applied.
    pub recovery_strategy: Option<RecoveryStrategy>,
    /// Duration of the last attempt in seconds.
    pub duration_secs: Option<f64>,
}

/// The result handed to callers once a run is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Run id.
    pub run_id: Uuid,
    /// Run name.
    pub name: String,
    /// Final status.
    pub status: PipelineStatus,
    /// Wall-clock duration in seconds.
    pub duration_secs: f64,
    /// Start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Kinds that succeeded.
    pub successful_kinds: Vec<String>,
    /// Kinds that did not succeed.
    pub failed_kinds: Vec<String>,
    /// Cumulative artifacts.
    pub artifacts: HashMap<String, Value>,
    /// Sum of execution durations in seconds.
    pub total_execution_time_secs: f64,
    /// `min(1, total execution time / wall-clock time)`.
    pub parallel_efficiency: f64,
    /// Total retries across executions.
    pub retry_count: u32,
    /// Successful outputs by kind.
    pub outputs: HashMap<String, WorkOutput>,
    /// Per-execution detail.
    pub executions: Vec<ExecutionSummary>,
}

impl PipelineResult {
    /// Builds the result from a run that has been marked completed.
    #[must_use]
    pub fn from_run(run: &PipelineRun) -> Self {
        let mut successful_kinds = Vec::new();
        let mut failed_kinds = Vec::new();
        let mut outputs = HashMap::new();
        for exec in &run.executions {
            if exec.status == ExecutionStatus::Success {
                successful_kinds.push(exec.kind.clone());
                if let Some(output) = &exec.output {
                    outputs.insert(exec.kind.clone(), output.clone());
                }
            } else {
                failed_kinds.push(exec.kind.clone());
            }
        }

        let duration_secs = run.elapsed_secs();
        let total_execution_time_secs: f64 =
            run.executions.iter().filter_map(|e| e.duration_secs).sum();
        let parallel_efficiency = if duration_secs > 0.0 {
            (total_execution_time_secs / duration_secs).min(1.0)
        } else {
            0.0
        };

        Self {
            run_id: run.id,
            name: run.name.clone(),
            status: run.status,
            duration_secs,
            started_at: run.started_at,
            completed_at: run.completed_at,
            successful_kinds,
            failed_kinds,
            artifacts: run.artifacts.clone(),
            total_execution_time_secs,
            parallel_efficiency,
            retry_count: run.retry_count(),
            outputs,
            executions: run
                .executions
                .iter()
                .map(|e| ExecutionSummary {
                    id: e.id,
                    kind: e.kind.clone(),
                    status: e.status,
                    attempts: e.attempt_number,
                    last_error: e.last_error.clone(),
                    recovery_strategy: e.recovery_strategy,
                    duration_secs: e.duration_secs,
                })
                .collect(),
        }
    }

    /// True for success and partial success.
    #[must_use]
    pub fn is_successful(&self) -> bool {
        matches!(self.status, PipelineStatus::Success | PipelineStatus::PartialSuccess)
    }

    /// Percentage of executions that succeeded.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let total = self.successful_kinds.len() + self.failed_kinds.len();
        if total == 0 {
            0.0
        } else {
            self.successful_kinds.len() as f64 / total as f64 * 100.0
        }
    }

    /// Summary for the given kind.
    #[must_use]
    pub fn execution(&self, kind: &str) -> Option<&ExecutionSummary> {
        self.executions.iter().find(|e| e.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestrationConfig;
    use crate::core::PipelineSubmission;

    #[test]
    fn test_result_from_partial_run() {
        let submission = PipelineSubmission::sequence("r", "", ["a", "b"]);
        let mut run = PipelineRun::from_submission(&submission, &OrchestrationConfig::default());
        run.mark_started();
        {
            let a = &mut run.executions[0];
            a.mark_started().unwrap();
            a.mark_completed(WorkOutput::default().with_artifact("plan", Value::Bool(true)))
                .unwrap();
        }
        run.artifacts.insert("plan".into(), Value::Bool(true));
        run.executions[1].mark_started().unwrap();
        run.executions[1].mark_failed("boom").unwrap();
        run.mark_completed();

        let result = PipelineResult::from_run(&run);
        assert_eq!(result.status, PipelineStatus::PartialSuccess);
        assert!(result.is_successful());
        assert_eq!(result.successful_kinds, vec!["a".to_string()]);
        assert_eq!(result.failed_kinds, vec!["b".to_string()]);
        assert!((result.success_rate() - 50.0).abs() < 1e-9);
        assert!(result.parallel_efficiency <= 1.0);
        assert_eq!(result.execution("b").unwrap().last_error.as_deref(), Some("boom"));
        assert!(result.outputs.contains_key("a"));
    }
}
