//! Failure recovery: analysis, strategy execution and circuit breaking.
//!
//! [`FailureRecovery`] is shared by every run of an executor. For each
//! failed attempt it classifies the fault, picks a [`RecoveryStrategy`] and
//! applies it to the run's bookkeeping. It never sleeps or calls handlers
//! itself; the returned [`RecoveryOutcome`] tells the caller what to do
//! next (wait and retry, run a fallback handler, or stop).

mod analyzer;
mod backoff;
mod circuit_breaker;

pub use analyzer::{
    assess_severity, classify, classify_fault, default_strategy, estimated_recovery_secs,
    is_transient, recovery_actions, FailureAnalysis, FailureAnalyzer, FailureCategory,
    RecoveryStrategy, MAX_RECOVERY_ESTIMATE_SECS,
};
pub use backoff::{BackoffState, JitterStrategy, RetryPolicy};
pub use circuit_breaker::{Admission, CircuitBreaker, CircuitState, CircuitStatus};

use crate::config::{secs, CircuitBreakerConfig, OrchestrationConfig, RecoveryConfig};
use crate::core::{ExecutionStatus, PipelineRun, Severity, WorkOutput};
use crate::errors::{ExecutionFault, OrchestrationError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Structured record emitted when a failure needs a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionRecord {
    /// Owning run.
    pub run_id: Uuid,
    /// Failed execution.
    pub execution_id: Uuid,
    /// Its kind.
    pub kind: String,
    /// Classified cause.
    pub category: FailureCategory,
    /// Assessed severity.
    pub severity: Severity,
    /// The error text.
    pub error: String,
    /// The attempt that failed.
    pub attempt: u32,
    /// Suggested actions.
    pub recovery_actions: Vec<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

/// What the caller must do after recovery has run.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// The execution is pending again; wait `delay` before relaunching it.
    Retry {
        /// Backoff plus estimated recovery time.
        delay: Duration,
    },
    /// The execution was resolved with a placeholder success.
    Resolved,
    /// Run the fallback handler, then report through
    /// [`FailureRecovery::complete_fallback`] or
    /// [`FailureRecovery::fail_fallback`].
    Fallback {
        /// Kind whose handler substitutes for the failed one.
        fallback_kind: String,
    },
    /// The execution failed terminally.
    Terminal {
        /// Present when manual intervention is required.
        intervention: Option<InterventionRecord>,
    },
}

impl RecoveryOutcome {
    /// True if the outcome ends the execution as failed.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. })
    }
}

/// Everything recovery decided for one failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryReport {
    /// The analysis of the fault.
    pub analysis: FailureAnalysis,
    /// The strategy actually applied.
    pub strategy: RecoveryStrategy,
    /// What the caller must do next.
    pub outcome: RecoveryOutcome,
    /// Executions reset by a rollback.
    pub rolled_back: Vec<Uuid>,
}

/// Recovery counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStats {
    /// Failed attempts handled.
    pub total_failures: u64,
    /// Failures that were retried or resolved without terminal failure.
    pub successful_recoveries: u64,
    /// `successful_recoveries / total_failures * 100`.
    pub success_rate: f64,
    /// Strategy -> times applied.
    pub strategies_used: BTreeMap<String, u64>,
    /// Category -> failures seen.
    pub failure_types: BTreeMap<String, u64>,
    /// Mean time spent deciding, in seconds.
    pub average_recovery_time_secs: f64,
    /// Manual interventions requested.
    pub interventions: u64,
}

/// Health of the recovery subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryHealth {
    /// "healthy" or "degraded".
    pub status: String,
    /// Kinds whose breaker is not closed.
    pub open_circuits: Vec<String>,
    /// Recovery success rate in percent.
    pub success_rate: f64,
    /// Failed attempts handled.
    pub total_failures: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    total_failures: u64,
    successful_recoveries: u64,
    strategies_used: BTreeMap<String, u64>,
    failure_types: BTreeMap<String, u64>,
    total_recovery_time: Duration,
    interventions: u64,
}

/// Engine-wide failure recovery.
#[derive(Debug)]
pub struct FailureRecovery {
    analyzer: FailureAnalyzer,
    config: RecoveryConfig,
    breaker_config: CircuitBreakerConfig,
    retry_policy: RetryPolicy,
    retry_on_timeout: bool,
    breakers: DashMap<String, CircuitBreaker>,
    backoff: Mutex<BackoffState>,
    stats: Mutex<StatsInner>,
}

impl FailureRecovery {
    /// Creates recovery from the engine configuration.
    #[must_use]
    pub fn new(config: &OrchestrationConfig) -> Self {
        Self {
            analyzer: FailureAnalyzer::new(config.recovery.clone()),
            config: config.recovery.clone(),
            breaker_config: config.circuit_breaker.clone(),
            retry_policy: RetryPolicy::from_config(config),
            retry_on_timeout: config.retry_on_timeout,
            breakers: DashMap::new(),
            backoff: Mutex::new(BackoffState::new()),
            stats: Mutex::new(StatsInner::default()),
        }
    }

    /// The analyzer in use.
    #[must_use]
    pub fn analyzer(&self) -> &FailureAnalyzer {
        &self.analyzer
    }

    /// Handles a failed attempt of `execution_id`.
    ///
    /// The execution must already be marked failed or timed out. The run is
    /// updated in place: retries re-enter `Pending`, skips become a
    /// placeholder success, terminal outcomes leave it `Failure`.
    pub fn handle_execution_failure(
        &self,
        run: &mut PipelineRun,
        execution_id: Uuid,
        fault: &ExecutionFault,
    ) -> Result<RecoveryReport> {
        let started = Instant::now();
        let exec = run
            .execution(execution_id)
            .ok_or_else(|| unknown_execution(execution_id))?;
        let kind = exec.kind.clone();
        let analysis = self.analyzer.analyze(fault, exec.attempt_number);

        let mut strategy = analysis.strategy;
        let consumed = !Self::succeeded_dependents(run, &kind).is_empty();
        if strategy == RecoveryStrategy::Retry && consumed {
            strategy = RecoveryStrategy::Rollback;
        }
        let retry_blocked = fault.is_timeout() && !self.retry_on_timeout;

        info!(
            run_id = %run.id,
            execution_id = %execution_id,
            kind = %kind,
            category = %analysis.category,
            severity = %analysis.severity,
            strategy = %strategy,
            attempt = analysis.attempt,
            "Handling execution failure"
        );

        let mut rolled_back = Vec::new();
        let outcome = match strategy {
            RecoveryStrategy::Retry if retry_blocked => Self::terminal(run, execution_id, None)?,
            RecoveryStrategy::Retry => self.retry(run, execution_id, &analysis)?,
            RecoveryStrategy::CircuitBreaker => {
                if retry_blocked {
                    Self::terminal(run, execution_id, None)?
                } else if self.circuit_allows(&kind) {
                    self.retry(run, execution_id, &analysis)?
                } else {
                    strategy = RecoveryStrategy::Skip;
                    Self::skip(run, execution_id, &kind, &analysis.error)?
                }
            }
            RecoveryStrategy::Rollback => {
                for id in Self::succeeded_dependents(run, &kind) {
                    if let Some(dependent) = run.execution_mut(id) {
                        dependent.reset_for_rollback()?;
                        rolled_back.push(id);
                    }
                }
                if !rolled_back.is_empty() {
                    info!(
                        run_id = %run.id,
                        kind = %kind,
                        count = rolled_back.len(),
                        "Rolled back dependents"
                    );
                    run.update_progress();
                }
                if retry_blocked {
                    Self::terminal(run, execution_id, None)?
                } else {
                    self.retry(run, execution_id, &analysis)?
                }
            }
            RecoveryStrategy::Skip => Self::skip(run, execution_id, &kind, &analysis.error)?,
            RecoveryStrategy::Fallback => match self.config.fallback_kinds.get(&kind) {
                Some(fallback) => RecoveryOutcome::Fallback {
                    fallback_kind: fallback.clone(),
                },
                None => {
                    debug!(kind = %kind, "No fallback configured, skipping");
                    strategy = RecoveryStrategy::Skip;
                    Self::skip(run, execution_id, &kind, &analysis.error)?
                }
            },
            RecoveryStrategy::ManualIntervention => {
                let record = InterventionRecord {
                    run_id: run.id,
                    execution_id,
                    kind: kind.clone(),
                    category: analysis.category,
                    severity: analysis.severity,
                    error: analysis.error.clone(),
                    attempt: analysis.attempt,
                    recovery_actions: analysis.recovery_actions.clone(),
                    created_at: Utc::now(),
                };
                warn!(
                    run_id = %run.id,
                    execution_id = %execution_id,
                    kind = %kind,
                    error = %analysis.error,
                    "Manual intervention required"
                );
                Self::terminal(
                    run,
                    execution_id,
                    Some(format!("Manual intervention required: {}", analysis.error)),
                )?;
                RecoveryOutcome::Terminal {
                    intervention: Some(record),
                }
            }
        };

        if let Some(exec) = run.execution_mut(execution_id) {
            exec.recovery_strategy = Some(strategy);
        }
        if !matches!(outcome, RecoveryOutcome::Retry { .. }) {
            self.backoff.lock().forget(&execution_id.to_string());
        }
        self.record_stats(&analysis, strategy, &outcome, started.elapsed());

        Ok(RecoveryReport {
            analysis,
            strategy,
            outcome,
            rolled_back,
        })
    }

    fn succeeded_dependents(run: &PipelineRun, kind: &str) -> Vec<Uuid> {
        run.transitive_dependents(kind)
            .into_iter()
            .filter(|id| {
                run.execution(*id)
                    .is_some_and(|e| e.status == ExecutionStatus::Success)
            })
            .collect()
    }

    fn retry(
        &self,
        run: &mut PipelineRun,
        execution_id: Uuid,
        analysis: &FailureAnalysis,
    ) -> Result<RecoveryOutcome> {
        let exec = run
            .execution_mut(execution_id)
            .ok_or_else(|| unknown_execution(execution_id))?;
        let failed_attempt = exec.attempt_number;
        let strategy = exec.retry_strategy;
        if !exec.prepare_retry()? {
            debug!(execution_id = %execution_id, attempts = failed_attempt, "Retries exhausted");
            return Self::terminal(run, execution_id, None);
        }

        let backoff = self.backoff.lock().delay(
            &execution_id.to_string(),
            &self.retry_policy,
            strategy,
            failed_attempt,
        );
        let estimate = if self.config.apply_recovery_estimates {
            analysis.estimated_recovery_secs.map_or(Duration::ZERO, secs)
        } else {
            Duration::ZERO
        };
        Ok(RecoveryOutcome::Retry {
            delay: backoff + estimate,
        })
    }

    fn skip(
        run: &mut PipelineRun,
        execution_id: Uuid,
        kind: &str,
        error: &str,
    ) -> Result<RecoveryOutcome> {
        if let Some(exec) = run.execution_mut(execution_id) {
            exec.substitute_success(WorkOutput::skipped(kind, error))?;
        }
        run.update_progress();
        Ok(RecoveryOutcome::Resolved)
    }

    fn terminal(
        run: &mut PipelineRun,
        execution_id: Uuid,
        error: Option<String>,
    ) -> Result<RecoveryOutcome> {
        if let Some(exec) = run.execution_mut(execution_id) {
            exec.mark_terminal_failure(error)?;
        }
        run.update_progress();
        Ok(RecoveryOutcome::Terminal { intervention: None })
    }

    /// Records the fallback handler's output as the execution's result,
    /// annotated with its provenance.
    pub fn complete_fallback(
        &self,
        run: &mut PipelineRun,
        execution_id: Uuid,
        fallback_kind: &str,
        output: WorkOutput,
    ) -> Result<()> {
        let exec = run
            .execution_mut(execution_id)
            .ok_or_else(|| unknown_execution(execution_id))?;
        let original_error = exec.last_error.clone().unwrap_or_default();
        let output = output
            .with_confidence(0.5)
            .with_metadata("fallback", json!(true))
            .with_metadata("original_kind", json!(exec.kind))
            .with_metadata("fallback_kind", json!(fallback_kind))
            .with_metadata("original_error", json!(original_error));
        exec.substitute_success(output)?;
        info!(execution_id = %execution_id, fallback_kind, "Fallback succeeded");
        run.update_progress();
        Ok(())
    }

    /// Marks the execution terminally failed after its fallback failed.
    pub fn fail_fallback(
        &self,
        run: &mut PipelineRun,
        execution_id: Uuid,
        fallback_kind: &str,
        error: &str,
    ) -> Result<()> {
        warn!(execution_id = %execution_id, fallback_kind, error, "Fallback failed");
        {
            let mut stats = self.stats.lock();
            stats.successful_recoveries = stats.successful_recoveries.saturating_sub(1);
        }
        Self::terminal(
            run,
            execution_id,
            Some(format!("Fallback '{fallback_kind}' failed: {error}")),
        )?;
        Ok(())
    }

    fn record_stats(
        &self,
        analysis: &FailureAnalysis,
        strategy: RecoveryStrategy,
        outcome: &RecoveryOutcome,
        elapsed: Duration,
    ) {
        let mut stats = self.stats.lock();
        stats.total_failures += 1;
        *stats.strategies_used.entry(strategy.to_string()).or_default() += 1;
        *stats
            .failure_types
            .entry(analysis.category.to_string())
            .or_default() += 1;
        stats.total_recovery_time += elapsed;
        match outcome {
            RecoveryOutcome::Terminal { intervention } => {
                if intervention.is_some() {
                    stats.interventions += 1;
                }
            }
            _ => stats.successful_recoveries += 1,
        }
    }

    /// Admits an attempt of `kind`, consuming a half-open trial if needed.
    pub fn acquire_circuit(&self, kind: &str) -> bool {
        self.admit_circuit(kind).is_some()
    }

    /// Admits an attempt of `kind` and reports how it was admitted.
    pub fn admit_circuit(&self, kind: &str) -> Option<Admission> {
        self.breakers
            .entry(kind.to_string())
            .or_insert_with(|| CircuitBreaker::new(kind, &self.breaker_config))
            .admit(Instant::now())
    }

    /// Hands back a half-open trial of `kind` whose attempt was abandoned.
    pub fn release_circuit_trial(&self, kind: &str, window: u64) -> bool {
        self.breakers
            .get_mut(kind)
            .is_some_and(|mut breaker| breaker.release_trial(window))
    }

    /// Whether an attempt of `kind` would be admitted now.
    #[must_use]
    pub fn circuit_allows(&self, kind: &str) -> bool {
        self.breakers
            .get(kind)
            .map_or(true, |breaker| breaker.allows(Instant::now()))
    }

    /// Records a successful attempt of `kind`.
    pub fn record_attempt_success(&self, kind: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(kind) {
            breaker.record_success();
        }
    }

    /// Records a failed attempt of `kind`.
    pub fn record_attempt_failure(&self, kind: &str) {
        self.breakers
            .entry(kind.to_string())
            .or_insert_with(|| CircuitBreaker::new(kind, &self.breaker_config))
            .record_failure(Instant::now());
    }

    /// Current state of the breaker for `kind`.
    #[must_use]
    pub fn circuit_state(&self, kind: &str) -> CircuitState {
        self.breakers
            .get(kind)
            .map_or(CircuitState::Closed, |breaker| breaker.state())
    }

    /// Status of every breaker, keyed by kind.
    #[must_use]
    pub fn circuit_status(&self) -> BTreeMap<String, CircuitStatus> {
        let now = Instant::now();
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().status(now)))
            .collect()
    }

    /// Forces the breaker for `kind` closed. Returns false if none exists.
    pub fn reset_circuit_breaker(&self, kind: &str) -> bool {
        match self.breakers.get_mut(kind) {
            Some(mut breaker) => {
                breaker.reset();
                info!(kind, "Circuit breaker reset");
                true
            }
            None => false,
        }
    }

    /// Recovery counters.
    #[must_use]
    pub fn stats(&self) -> RecoveryStats {
        let stats = self.stats.lock();
        let success_rate = if stats.total_failures == 0 {
            0.0
        } else {
            stats.successful_recoveries as f64 / stats.total_failures as f64 * 100.0
        };
        let average_recovery_time_secs = if stats.total_failures == 0 {
            0.0
        } else {
            stats.total_recovery_time.as_secs_f64() / stats.total_failures as f64
        };
        RecoveryStats {
            total_failures: stats.total_failures,
            successful_recoveries: stats.successful_recoveries,
            success_rate,
            strategies_used: stats.strategies_used.clone(),
            failure_types: stats.failure_types.clone(),
            average_recovery_time_secs,
            interventions: stats.interventions,
        }
    }

    /// Health summary: degraded while any breaker is not closed or fewer
    /// than half of the failures were recovered.
    #[must_use]
    pub fn health(&self) -> RecoveryHealth {
        let stats = self.stats();
        let mut open_circuits: Vec<String> = self
            .breakers
            .iter()
            .filter(|entry| entry.value().state() != CircuitState::Closed)
            .map(|entry| entry.key().clone())
            .collect();
        open_circuits.sort();
        let degraded = !open_circuits.is_empty()
            || (stats.total_failures > 0 && stats.success_rate < 50.0);
        RecoveryHealth {
            status: if degraded { "degraded" } else { "healthy" }.to_string(),
            open_circuits,
            success_rate: stats.success_rate,
            total_failures: stats.total_failures,
        }
    }

    /// Failure counts per category, for the monitor.
    #[must_use]
    pub fn failure_types(&self) -> HashMap<String, u64> {
        self.stats.lock().failure_types.clone().into_iter().collect()
    }
}

fn unknown_execution(execution_id: Uuid) -> OrchestrationError {
    OrchestrationError::Internal(format!("unknown execution {execution_id}"))
}
