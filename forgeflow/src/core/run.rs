//! Pipeline run aggregate.

use super::{ExecutionStatus, PipelineStatus, PipelineSubmission, WorkUnitExecution};
use crate::config::OrchestrationConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// All executions submitted together, plus run-level bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique run id.
    pub id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Free-form brief.
    pub brief: String,
    /// Shared context passed to handlers.
    #[serde(default)]
    pub project_context: HashMap<String, Value>,
    /// Current status.
    pub status: PipelineStatus,
    /// Executions in submission (or optimized) order.
    pub executions: Vec<WorkUnitExecution>,
    /// Maximum number of executions running at once.
    pub max_parallel: usize,
    /// Executions currently holding a slot.
    pub currently_running: usize,
    /// Artifacts merged from every successful output.
    #[serde(default)]
    pub artifacts: HashMap<String, Value>,
    /// `100 * completed / total`.
    pub progress_percentage: f64,
    /// Number of successful executions.
    pub completed_count: usize,
    /// Number of terminally failed executions.
    pub failed_count: usize,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Creates an empty run.
    #[must_use]
    pub fn new(name: impl Into<String>, brief: impl Into<String>, max_parallel: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            brief: brief.into(),
            project_context: HashMap::new(),
            status: PipelineStatus::Created,
            executions: Vec::new(),
            max_parallel: max_parallel.max(1),
            currently_running: 0,
            artifacts: HashMap::new(),
            progress_percentage: 0.0,
            completed_count: 0,
            failed_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Builds a run from a submission, filling unit defaults from `config`.
    #[must_use]
    pub fn from_submission(submission: &PipelineSubmission, config: &OrchestrationConfig) -> Self {
        let mut run = Self::new(&submission.name, &submission.brief, config.max_parallel_agents);
        run.project_context = submission.project_context.clone();
        for unit in &submission.units {
            let mut execution = WorkUnitExecution::new(run.id, &unit.kind)
                .with_depends_on(unit.depends_on.iter().cloned())
                .with_priority(unit.priority)
                .with_max_attempts(unit.max_attempts.unwrap_or(config.default_max_attempts))
                .with_retry_strategy(unit.retry_strategy.unwrap_or(config.default_retry_strategy))
                .with_resources(unit.resources.clone())
                .with_configuration(unit.configuration.clone());
            if let Some(secs) = unit.estimated_duration_secs {
                execution = execution.with_estimated_duration(secs);
            }
            run.add_execution(execution);
        }
        run
    }

    /// Adds an execution to the run.
    pub fn add_execution(&mut self, mut execution: WorkUnitExecution) {
        execution.run_id = self.id;
        self.executions.push(execution);
    }

    /// Finds an execution by id.
    #[must_use]
    pub fn execution(&self, id: Uuid) -> Option<&WorkUnitExecution> {
        self.executions.iter().find(|e| e.id == id)
    }

    /// Finds an execution by id, mutably.
    pub fn execution_mut(&mut self, id: Uuid) -> Option<&mut WorkUnitExecution> {
        self.executions.iter_mut().find(|e| e.id == id)
    }

    /// Finds an execution by kind.
    #[must_use]
    pub fn execution_by_kind(&self, kind: &str) -> Option<&WorkUnitExecution> {
        self.executions.iter().find(|e| e.kind == kind)
    }

    /// Kinds whose execution has succeeded.
    #[must_use]
    pub fn succeeded_kinds(&self) -> HashSet<&str> {
        self.executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Success)
            .map(|e| e.kind.as_str())
            .collect()
    }

    /// Waiting (pending or queued) executions whose dependencies have all
    /// succeeded, highest priority first.
    #[must_use]
    pub fn ready_executions(&self) -> Vec<&WorkUnitExecution> {
        let succeeded = self.succeeded_kinds();
        let mut ready: Vec<&WorkUnitExecution> = self
            .executions
            .iter()
            .filter(|e| e.status.is_waiting() && e.dependencies_satisfied(&succeeded))
            .collect();
        ready.sort_by(|a, b| b.priority.cmp(&a.priority));
        ready
    }

    /// Pending executions that can never start because a dependency ended
    /// without succeeding, paired with that dependency's kind.
    #[must_use]
    pub fn blocked_executions(&self) -> Vec<(Uuid, String)> {
        let dead: HashSet<&str> = self
            .executions
            .iter()
            .filter(|e| matches!(e.status, ExecutionStatus::Failure | ExecutionStatus::Cancelled))
            .map(|e| e.kind.as_str())
            .collect();
        self.executions
            .iter()
            .filter(|e| e.status.is_waiting())
            .filter_map(|e| {
                e.depends_on
                    .iter()
                    .find(|d| dead.contains(d.as_str()))
                    .map(|d| (e.id, d.clone()))
            })
            .collect()
    }

    /// Ids of every execution that transitively depends on `kind`.
    #[must_use]
    pub fn transitive_dependents(&self, kind: &str) -> Vec<Uuid> {
        let mut found = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut frontier: VecDeque<&str> = VecDeque::from([kind]);
        while let Some(current) = frontier.pop_front() {
            for exec in &self.executions {
                if exec.depends_on.iter().any(|d| d == current) && seen.insert(exec.kind.as_str()) {
                    found.push(exec.id);
                    frontier.push_back(exec.kind.as_str());
                }
            }
        }
        found
    }

    /// Outputs of an execution's dependencies keyed by kind, and their merged
    /// context updates.
    #[must_use]
    pub fn dependency_inputs(
        &self,
        execution: &WorkUnitExecution,
    ) -> (HashMap<String, Value>, HashMap<String, Value>) {
        let mut outputs = HashMap::new();
        let mut context = HashMap::new();
        for dep in &execution.depends_on {
            if let Some(output) = self.execution_by_kind(dep).and_then(|e| e.output.as_ref()) {
                outputs.insert(dep.clone(), output.result.clone());
                context.extend(output.context_updates.clone());
            }
        }
        (outputs, context)
    }

    /// Recomputes the completed/failed counters and progress.
    pub fn update_progress(&mut self) {
        let total = self.executions.len();
        self.completed_count = self
            .executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Success)
            .count();
        self.failed_count = self
            .executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Failure)
            .count();
        self.progress_percentage = if total == 0 {
            0.0
        } else {
            self.completed_count as f64 / total as f64 * 100.0
        };
    }

    /// True when every execution is terminal.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.executions.iter().all(|e| e.status.is_terminal())
    }

    /// Marks the run as started.
    pub fn mark_started(&mut self) {
        self.status = PipelineStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Status derived from execution outcomes.
    #[must_use]
    pub fn outcome_status(&self) -> PipelineStatus {
        let succeeded = self
            .executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Success)
            .count();
        if succeeded == self.executions.len() {
            PipelineStatus::Success
        } else if succeeded > 0 {
            PipelineStatus::PartialSuccess
        } else {
            PipelineStatus::Failure
        }
    }

    /// Marks the run completed; an explicit cancellation is preserved.
    pub fn mark_completed(&mut self) {
        self.update_progress();
        if self.status != PipelineStatus::Cancelled {
            self.status = self.outcome_status();
        }
        self.completed_at = Some(Utc::now());
    }

    /// Cancels every non-terminal execution, returning the ids changed.
    pub fn cancel_pending(&mut self, reason: &str) -> Vec<Uuid> {
        self.executions
            .iter_mut()
            .filter_map(|e| e.cancel(reason).then_some(e.id))
            .collect()
    }

    /// Total retries across executions.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.executions
            .iter()
            .map(|e| e.attempt_number.saturating_sub(1))
            .sum()
    }

    /// Seconds since the run started, or zero if it has not.
    #[must_use]
    pub fn elapsed_secs(&self) -> f64 {
        self.started_at.map_or(0.0, |start| {
            let end = self.completed_at.unwrap_or_else(Utc::now);
            (end - start).num_milliseconds() as f64 / 1000.0
        })
    }
}
