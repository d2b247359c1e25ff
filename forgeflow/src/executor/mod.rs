//! Pipeline execution.
//!
//! [`PipelineExecutor`] is the engine's entry point. It validates
//! submissions, keeps every run it created, drives runs through the
//! scheduler and failure recovery, and exposes run control (pause, resume,
//! cancel) and reporting.
//!
//! # Example
//!
//! ```rust,ignore
//! use forgeflow::prelude::*;
//!
//! let registry = Arc::new(HandlerRegistry::new());
//! registry.register_instance("designer", Arc::new(MyDesigner));
//! registry.register_instance("coder", Arc::new(MyCoder));
//!
//! let executor = PipelineExecutor::builder(OrchestrationConfig::default())
//!     .with_handlers(registry)
//!     .build()?;
//! let result = executor
//!     .run(PipelineSubmission::sequence("feature", "Add login", ["designer", "coder"]))
//!     .await?;
//! assert!(result.is_successful());
//! ```

mod driver;
mod insights;
mod unit;

#[cfg(test)]
mod integration_tests;

pub use insights::{
    ExecutionInsight, InsightSummary, PerformanceRating, PipelineInsights, TimelineEntry,
};

use crate::cancellation::CancellationToken;
use crate::config::OrchestrationConfig;
use crate::core::{PipelineResult, PipelineRun, PipelineStatus, PipelineSubmission};
use crate::errors::{ExecutionFault, OrchestrationError, Result};
use crate::events::{EventSink, EventType, LoggingEventSink, RunEmitter};
use crate::graph::{
    DependencyAnalysis, DependencyManager, OptimizationSuggestion, ValidationStats,
    ValidationStatsSnapshot,
};
use crate::handlers::HandlerRegistry;
use crate::monitor::{
    MonitorHealth, MonitorSnapshot, PipelineMonitor, ProgressSnapshot, RunMetrics,
};
use crate::recovery::{
    CircuitStatus, FailureRecovery, RecoveryHealth, RecoveryOutcome, RecoveryStats,
};
use crate::scheduler::{ScheduleOptimization, Scheduler, SchedulerMetrics};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

/// Queue length above which a backlog recommendation is made.
const QUEUE_BACKLOG_THRESHOLD: usize = 0;
/// CPU utilization (percent) above which a resource recommendation is made.
const HIGH_CPU_UTILIZATION: f64 = 80.0;
/// Parallelism potential above which more slots are recommended.
const HIGH_PARALLELISM_POTENTIAL: f64 = 0.7;
/// Slot count below which more slots are recommended.
const LOW_MAX_PARALLEL: usize = 5;
/// Upper bound of the suggested slot count.
const MAX_SUGGESTED_PARALLEL: usize = 10;

/// Roughly 1.5x the current slot count, at least one more, capped.
fn suggested_max_parallel(current: usize) -> usize {
    (current * 3 / 2).clamp(current + 1, MAX_SUGGESTED_PARALLEL.max(current + 1))
}

/// Everything the engine keeps for one run.
pub(crate) struct RunHandle {
    id: Uuid,
    /// Engine configuration with the run's overrides applied.
    config: OrchestrationConfig,
    run: Arc<Mutex<PipelineRun>>,
    scheduler: Mutex<Scheduler>,
    emitter: Arc<RunEmitter>,
    cancel: Arc<CancellationToken>,
    pause: watch::Sender<bool>,
    done: watch::Sender<Option<PipelineResult>>,
    /// Fallbacks requested outside the driver, launched on its next pass.
    fallback_requests: Mutex<Vec<(Uuid, String)>>,
    /// Retry deadlines set outside the driver. Written and drained only
    /// while the run lock is held.
    retry_requests: Mutex<Vec<(Uuid, Instant)>>,
    wake: Notify,
}

impl RunHandle {
    fn status(&self) -> PipelineStatus {
        self.run.lock().status
    }
}

/// Executor-wide counters.
#[derive(Debug, Default)]
struct ExecutorStats {
    pipelines_executed: u64,
    successful: u64,
    partial: u64,
    failed: u64,
    cancelled: u64,
    total_duration_secs: f64,
    units_executed: u64,
}

pub(crate) struct ExecutorInner {
    config: OrchestrationConfig,
    registry: Arc<HandlerRegistry>,
    recovery: Arc<FailureRecovery>,
    monitor: Arc<PipelineMonitor>,
    sink: Arc<dyn EventSink>,
    permits: Arc<Semaphore>,
    runs: RwLock<HashMap<Uuid, Arc<RunHandle>>>,
    validation: ValidationStats,
    stats: Mutex<ExecutorStats>,
}

impl ExecutorInner {
    fn record_completion(&self, result: &PipelineResult) {
        let mut stats = self.stats.lock();
        stats.pipelines_executed += 1;
        match result.status {
            PipelineStatus::Success => stats.successful += 1,
            PipelineStatus::PartialSuccess => stats.partial += 1,
            PipelineStatus::Cancelled => stats.cancelled += 1,
            _ => stats.failed += 1,
        }
        stats.total_duration_secs += result.duration_secs;
        stats.units_executed += result
            .executions
            .iter()
            .filter(|e| e.duration_secs.is_some())
            .count() as u64;
    }
}

/// Metrics of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetrics {
    /// Run id.
    pub run_id: Uuid,
    /// Run status.
    pub status: PipelineStatus,
    /// Progress and ETA.
    pub progress: ProgressSnapshot,
    /// Monitor counters, once the run has been registered with the monitor.
    pub monitor: Option<RunMetrics>,
    /// Scheduler counters for the run.
    pub scheduler: SchedulerMetrics,
}

/// A run that has not reached a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveRun {
    /// Run id.
    pub run_id: Uuid,
    /// Run name.
    pub name: String,
    /// Status.
    pub status: PipelineStatus,
    /// Progress.
    pub progress_percentage: f64,
    /// Executions holding a slot.
    pub currently_running: usize,
    /// Start time, once started.
    pub started_at: Option<DateTime<Utc>>,
}

/// What a recommendation is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    /// Executions are waiting in the overflow queue.
    QueueBacklog,
    /// The resource pool is nearly saturated.
    HighCpuUsage,
    /// The graph could use more slots than the run has.
    IncreaseParallelism,
}

/// One tuning recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Topic.
    pub kind: RecommendationKind,
    /// What was observed.
    pub description: String,
    /// What to change.
    pub recommendation: String,
    /// Suggested slot count, for parallelism recommendations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_max_parallel: Option<usize>,
}

/// Tuning report for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationReport {
    /// Run id.
    pub run_id: Uuid,
    /// Runtime recommendations.
    pub recommendations: Vec<Recommendation>,
    /// Suggestions derived from the dependency structure.
    pub dependency_optimizations: Vec<OptimizationSuggestion>,
    /// Structural scheduling report.
    pub schedule: ScheduleOptimization,
}

/// A change made by [`PipelineExecutor::optimize_configuration`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AppliedOptimization {
    /// Executions were reordered before the run started.
    ExecutionOrderOptimized,
    /// The run's slot count was raised.
    MaxParallelIncreased {
        /// Previous slot count.
        from: usize,
        /// New slot count.
        to: usize,
    },
}

impl fmt::Display for AppliedOptimization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExecutionOrderOptimized => write!(f, "execution_order_optimized"),
            Self::MaxParallelIncreased { from, to } => {
                write!(f, "max_parallel_increased_{from}_to_{to}")
            }
        }
    }
}

/// Rough gains expected from the recommendations, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EstimatedImprovement {
    /// Wall-clock reduction.
    pub execution_time_reduction: f64,
    /// Better use of the slots.
    pub resource_utilization: f64,
    /// Fewer units held up by a single failure.
    pub failure_resilience: f64,
}

impl EstimatedImprovement {
    fn estimate(parallelism_potential: f64, restructurable: bool) -> Self {
        Self {
            execution_time_reduction: (parallelism_potential * 40.0).min(30.0),
            resource_utilization: (parallelism_potential * 25.0).min(20.0),
            failure_resilience: if restructurable { 15.0 } else { 0.0 },
        }
    }
}

/// Result of [`PipelineExecutor::optimize_configuration`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationOutcome {
    /// The recommendations the changes were derived from.
    pub report: OptimizationReport,
    /// Changes made to the run; empty unless applying.
    pub applied: Vec<AppliedOptimization>,
    /// Expected gains.
    pub estimated_improvement: EstimatedImprovement,
    /// Recommendations that could not be applied.
    pub warnings: Vec<String>,
}

/// Executor-wide counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorMetrics {
    /// Runs that reached a terminal status through the executor.
    pub pipelines_executed: u64,
    /// Of those, fully successful.
    pub successful_pipelines: u64,
    /// Partially successful.
    pub partial_pipelines: u64,
    /// Failed.
    pub failed_pipelines: u64,
    /// Cancelled.
    pub cancelled_pipelines: u64,
    /// `successful / executed * 100`.
    pub success_rate: f64,
    /// `failed / executed * 100`.
    pub failure_rate: f64,
    /// Mean wall-clock duration of finished runs.
    pub average_pipeline_duration_secs: f64,
    /// Executions that ran at least once.
    pub units_executed: u64,
    /// Runs not yet terminal.
    pub active_pipelines: usize,
    /// Runs retained.
    pub total_runs: usize,
    /// Failure recovery counters.
    pub recovery: RecoveryStats,
    /// Dependency validation counters.
    pub validation: ValidationStatsSnapshot,
}

/// Overall health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Score above 80.
    Healthy,
    /// Score above 50.
    Degraded,
    /// Anything lower.
    Unhealthy,
}

impl HealthStatus {
    /// Classifies a 0..=100 score.
    #[must_use]
    pub fn from_score(score: u8) -> Self {
        if score > 80 {
            Self::Healthy
        } else if score > 50 {
            Self::Degraded
        } else {
            Self::Unhealthy
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Executor health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Classification of `health_score`.
    pub status: HealthStatus,
    /// 0..=100.
    pub health_score: u8,
    /// What lowered the score.
    pub issues: Vec<String>,
    /// Runs not yet terminal.
    pub active_pipelines: usize,
    /// Engine-wide slot count.
    pub max_parallel_agents: usize,
    /// Kinds with a registered handler.
    pub registered_kinds: Vec<String>,
    /// Failure recovery health.
    pub recovery: RecoveryHealth,
    /// Monitor health.
    pub monitor: MonitorHealth,
    /// Whether dependency validation has mostly passed.
    pub validation_healthy: bool,
}

/// Builder for [`PipelineExecutor`].
pub struct ExecutorBuilder {
    config: OrchestrationConfig,
    registry: Option<Arc<HandlerRegistry>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl ExecutorBuilder {
    /// Starts from `config`.
    #[must_use]
    pub fn new(config: OrchestrationConfig) -> Self {
        Self {
            config,
            registry: None,
            sink: None,
        }
    }

    /// Uses `registry` to resolve handlers.
    #[must_use]
    pub fn with_handlers(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sends lifecycle events to `sink` instead of the tracing log.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validates the configuration and builds the executor.
    pub fn build(self) -> Result<PipelineExecutor> {
        self.config.validate()?;
        let inner = ExecutorInner {
            registry: self.registry.unwrap_or_default(),
            recovery: Arc::new(FailureRecovery::new(&self.config)),
            monitor: Arc::new(PipelineMonitor::new()),
            sink: self
                .sink
                .unwrap_or_else(|| Arc::new(LoggingEventSink::debug())),
            permits: Arc::new(Semaphore::new(self.config.max_parallel_agents)),
            runs: RwLock::new(HashMap::new()),
            validation: ValidationStats::default(),
            stats: Mutex::new(ExecutorStats::default()),
            config: self.config,
        };
        info!(
            max_parallel_agents = inner.config.max_parallel_agents,
            handlers = inner.registry.len(),
            "Pipeline executor ready"
        );
        Ok(PipelineExecutor {
            inner: Arc::new(inner),
        })
    }
}

/// The orchestration engine.
///
/// Cloning is cheap; clones share runs, circuit breakers and monitoring.
#[derive(Clone)]
pub struct PipelineExecutor {
    inner: Arc<ExecutorInner>,
}

impl PipelineExecutor {
    /// Creates an executor with the default event sink.
    pub fn new(config: OrchestrationConfig, registry: Arc<HandlerRegistry>) -> Result<Self> {
        ExecutorBuilder::new(config).with_handlers(registry).build()
    }

    /// Starts a builder.
    #[must_use]
    pub fn builder(config: OrchestrationConfig) -> ExecutorBuilder {
        ExecutorBuilder::new(config)
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestrationConfig {
        &self.inner.config
    }

    /// The handler registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    /// Shared failure recovery.
    #[must_use]
    pub fn recovery(&self) -> &FailureRecovery {
        &self.inner.recovery
    }

    fn handle(&self, run_id: Uuid) -> Result<Arc<RunHandle>> {
        self.inner
            .runs
            .read()
            .get(&run_id)
            .cloned()
            .ok_or(OrchestrationError::RunNotFound(run_id))
    }

    /// Creates a run from `submission` without starting it.
    ///
    /// Dependency cycles and references to undeclared kinds are rejected
    /// here, so an invalid run is never scheduled.
    pub fn create_run(&self, submission: PipelineSubmission) -> Result<Uuid> {
        submission.validate()?;
        let config = submission.overrides.apply(&self.inner.config)?;
        let mut run = PipelineRun::from_submission(&submission, &config);

        let validation = DependencyManager::from_run(&run).validate();
        self.inner.validation.record(&validation);
        if let Some(err) = validation.to_error() {
            warn!(name = %run.name, error = %err, "Rejected run with invalid dependencies");
            return Err(err.into());
        }
        for warning in &validation.warnings {
            warn!(name = %run.name, "{warning}");
        }
        if config.enable_pipeline_optimization {
            DependencyManager::optimize_execution_order(&mut run.executions);
        }

        let id = run.id;
        let scheduler = Scheduler::new(&config);
        info!(
            run_id = %id,
            name = %run.name,
            executions = run.executions.len(),
            strategy = %scheduler.strategy(),
            "Pipeline run created"
        );
        let handle = RunHandle {
            id,
            emitter: Arc::new(RunEmitter::new(id, Arc::clone(&self.inner.sink))),
            run: Arc::new(Mutex::new(run)),
            scheduler: Mutex::new(scheduler),
            cancel: Arc::new(CancellationToken::new()),
            pause: watch::Sender::new(false),
            done: watch::Sender::new(None),
            fallback_requests: Mutex::new(Vec::new()),
            retry_requests: Mutex::new(Vec::new()),
            wake: Notify::new(),
            config,
        };
        self.inner.runs.write().insert(id, Arc::new(handle));
        Ok(id)
    }

    fn claim(&self, run_id: Uuid) -> Result<Arc<RunHandle>> {
        let handle = self.handle(run_id)?;
        {
            let mut run = handle.run.lock();
            if run.status != PipelineStatus::Created {
                return Err(OrchestrationError::InvalidRunState {
                    run_id,
                    status: run.status,
                    action: "start",
                });
            }
            run.status = PipelineStatus::Queued;
        }
        Ok(handle)
    }

    /// Drives a created run to completion.
    pub async fn execute(&self, run_id: Uuid) -> Result<PipelineResult> {
        let handle = self.claim(run_id)?;
        Ok(driver::drive(Arc::clone(&self.inner), handle).await)
    }

    /// Starts a created run in the background. Use [`wait`](Self::wait)
    /// for its result.
    pub fn start(&self, run_id: Uuid) -> Result<()> {
        let handle = self.claim(run_id)?;
        tokio::spawn(driver::drive(Arc::clone(&self.inner), handle));
        Ok(())
    }

    /// Creates and executes a run.
    pub async fn run(&self, submission: PipelineSubmission) -> Result<PipelineResult> {
        let run_id = self.create_run(submission)?;
        self.execute(run_id).await
    }

    /// Waits until the run finishes. Never returns for a run that is not
    /// started.
    pub async fn wait(&self, run_id: Uuid) -> Result<PipelineResult> {
        let handle = self.handle(run_id)?;
        let mut done = handle.done.subscribe();
        let finished = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| OrchestrationError::Internal(format!("run {run_id} was dropped")))?;
        (*finished)
            .clone()
            .ok_or_else(|| OrchestrationError::Internal(format!("run {run_id} has no result")))
    }

    /// Suspends new launches; running executions drain.
    pub fn pause(&self, run_id: Uuid) -> Result<()> {
        let handle = self.handle(run_id)?;
        {
            let mut run = handle.run.lock();
            if run.status != PipelineStatus::Running {
                return Err(OrchestrationError::InvalidRunState {
                    run_id,
                    status: run.status,
                    action: "pause",
                });
            }
            run.status = PipelineStatus::Paused;
        }
        handle.pause.send_replace(true);
        handle.emitter.emit(EventType::RunPaused, json!({}));
        info!(run_id = %run_id, "Pipeline paused");
        Ok(())
    }

    /// Lifts a pause.
    pub fn resume(&self, run_id: Uuid) -> Result<()> {
        let handle = self.handle(run_id)?;
        {
            let mut run = handle.run.lock();
            if run.status != PipelineStatus::Paused {
                return Err(OrchestrationError::InvalidRunState {
                    run_id,
                    status: run.status,
                    action: "resume",
                });
            }
            run.status = PipelineStatus::Running;
        }
        handle.pause.send_replace(false);
        handle.emitter.emit(EventType::RunResumed, json!({}));
        info!(run_id = %run_id, "Pipeline resumed");
        Ok(())
    }

    /// Cancels the run and every execution that has not finished.
    ///
    /// Returns immediately; in-flight handlers are told through their
    /// cancellation token and their results are discarded.
    pub fn cancel(&self, run_id: Uuid) -> Result<()> {
        let handle = self.handle(run_id)?;
        let reason = "Pipeline cancelled";
        let (cancelled, never_started) = {
            let mut run = handle.run.lock();
            if run.status.is_terminal() {
                return Err(OrchestrationError::InvalidRunState {
                    run_id,
                    status: run.status,
                    action: "cancel",
                });
            }
            handle.cancel.cancel(reason);
            let never_started = run.status == PipelineStatus::Created;
            run.status = PipelineStatus::Cancelled;
            let cancelled = run.cancel_pending(reason);
            run.update_progress();
            (cancelled, never_started)
        };
        handle.pause.send_replace(false);
        handle.emitter.emit(
            EventType::RunCancelled,
            json!({"reason": reason, "cancelled_executions": cancelled.len()}),
        );
        info!(run_id = %run_id, cancelled = cancelled.len(), "Pipeline cancelled");

        if never_started {
            let result = {
                let mut run = handle.run.lock();
                run.mark_completed();
                PipelineResult::from_run(&run)
            };
            handle.emitter.emit(
                EventType::RunCompleted,
                json!({"status": result.status, "duration_secs": result.duration_secs}),
            );
            self.inner.record_completion(&result);
            handle.done.send_replace(Some(result));
        }
        Ok(())
    }

    /// Snapshot of the run.
    pub fn status(&self, run_id: Uuid) -> Result<PipelineRun> {
        Ok(self.handle(run_id)?.run.lock().clone())
    }

    /// The run's result, once it has finished.
    pub fn result(&self, run_id: Uuid) -> Result<Option<PipelineResult>> {
        Ok(self.handle(run_id)?.done.borrow().clone())
    }

    /// Current metrics of the run.
    pub fn metrics(&self, run_id: Uuid) -> Result<PipelineMetrics> {
        let handle = self.handle(run_id)?;
        let run = handle.run.lock().clone();
        let scheduler = handle.scheduler.lock().metrics();
        Ok(PipelineMetrics {
            run_id,
            status: run.status,
            progress: ProgressSnapshot::from_run(&run, Utc::now()),
            monitor: self.inner.monitor.metrics(&run),
            scheduler,
        })
    }

    /// Monitoring history of the run, oldest first. `None` returns the
    /// last 100 snapshots, `Some(0)` all retained ones.
    pub fn history(&self, run_id: Uuid, limit: Option<usize>) -> Result<Vec<MonitorSnapshot>> {
        self.handle(run_id)?;
        Ok(self.inner.monitor.history(run_id, limit))
    }

    /// Per-execution performance and timeline of the run.
    pub fn insights(&self, run_id: Uuid) -> Result<PipelineInsights> {
        let run = self.status(run_id)?;
        Ok(insights::build(&run, self.inner.monitor.performance_analysis(run_id)))
    }

    /// Runs that have not reached a terminal status.
    #[must_use]
    pub fn list_active(&self) -> Vec<ActiveRun> {
        let handles: Vec<Arc<RunHandle>> = self.inner.runs.read().values().cloned().collect();
        let mut active: Vec<ActiveRun> = handles
            .iter()
            .filter_map(|handle| {
                let run = handle.run.lock();
                (!run.status.is_terminal()).then(|| ActiveRun {
                    run_id: run.id,
                    name: run.name.clone(),
                    status: run.status,
                    progress_percentage: run.progress_percentage,
                    currently_running: run.currently_running,
                    started_at: run.started_at,
                })
            })
            .collect();
        active.sort_by_key(|r| r.started_at);
        active
    }

    /// Dependency analysis of the run.
    pub fn analyze_dependencies(&self, run_id: Uuid) -> Result<DependencyAnalysis> {
        let run = self.status(run_id)?;
        Ok(DependencyManager::from_run(&run).analyze())
    }

    /// Tuning recommendations for the run.
    pub fn optimization_recommendations(&self, run_id: Uuid) -> Result<OptimizationReport> {
        let handle = self.handle(run_id)?;
        let run = handle.run.lock().clone();
        let (metrics, schedule) = {
            let scheduler = handle.scheduler.lock();
            (scheduler.metrics(), scheduler.optimize_schedule(&run))
        };
        let manager = DependencyManager::from_run(&run);
        let mut recommendations = Vec::new();

        if metrics.queue_size > QUEUE_BACKLOG_THRESHOLD {
            recommendations.push(Recommendation {
                kind: RecommendationKind::QueueBacklog,
                description: format!("{} executions waiting in queue", metrics.queue_size),
                recommendation: "Consider increasing max_parallel_agents or resource ceilings"
                    .into(),
                suggested_max_parallel: None,
            });
        }
        if let Some(cpu) = metrics.pool.cpu_utilization {
            if cpu > HIGH_CPU_UTILIZATION {
                recommendations.push(Recommendation {
                    kind: RecommendationKind::HighCpuUsage,
                    description: format!("CPU utilization at {cpu:.1}%"),
                    recommendation: "Consider lowering parallelism or per-unit CPU requirements"
                        .into(),
                    suggested_max_parallel: None,
                });
            }
        }
        if let Ok(parallelism) = manager.parallelism() {
            if parallelism.potential > HIGH_PARALLELISM_POTENTIAL
                && run.max_parallel < LOW_MAX_PARALLEL
            {
                let suggested = suggested_max_parallel(run.max_parallel);
                recommendations.push(Recommendation {
                    kind: RecommendationKind::IncreaseParallelism,
                    description: format!(
                        "High parallelism potential ({:.2}) with only {} slots",
                        parallelism.potential, run.max_parallel
                    ),
                    recommendation: format!(
                        "Consider increasing max_parallel_agents to {suggested}"
                    ),
                    suggested_max_parallel: Some(suggested),
                });
            }
        }

        Ok(OptimizationReport {
            run_id,
            recommendations,
            dependency_optimizations: manager.suggest_optimizations(),
            schedule,
        })
    }

    /// Tuning recommendations for the run, applied when `apply` is set.
    ///
    /// Executions are reordered only before the run starts. A parallelism
    /// recommendation raises the run's slot count at any point before it
    /// finishes; the engine-wide concurrency limit still applies.
    pub fn optimize_configuration(&self, run_id: Uuid, apply: bool) -> Result<OptimizationOutcome> {
        let report = self.optimization_recommendations(run_id)?;
        let handle = self.handle(run_id)?;
        let mut applied = Vec::new();
        let mut warnings = Vec::new();

        let potential = {
            let mut run = handle.run.lock();
            if apply {
                if run.status.is_terminal() {
                    return Err(OrchestrationError::InvalidRunState {
                        run_id,
                        status: run.status,
                        action: "optimize",
                    });
                }
                if !report.dependency_optimizations.is_empty() {
                    if run.status == PipelineStatus::Created {
                        DependencyManager::optimize_execution_order(&mut run.executions);
                        applied.push(AppliedOptimization::ExecutionOrderOptimized);
                    } else {
                        warnings.push(format!(
                            "Execution order is fixed once the run is {}",
                            run.status
                        ));
                    }
                }
                let suggested = report
                    .recommendations
                    .iter()
                    .filter_map(|r| r.suggested_max_parallel)
                    .max();
                if let Some(to) = suggested.filter(|to| *to > run.max_parallel) {
                    let from = run.max_parallel;
                    run.max_parallel = to;
                    handle.scheduler.lock().set_max_parallel(to);
                    applied.push(AppliedOptimization::MaxParallelIncreased { from, to });
                }
            }
            DependencyManager::from_run(&run)
                .parallelism()
                .map_or(0.0, |p| p.potential)
        };

        if !applied.is_empty() {
            info!(
                run_id = %run_id,
                applied = ?applied.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "Applied run optimizations"
            );
            handle.wake.notify_one();
        }
        let estimated_improvement =
            EstimatedImprovement::estimate(potential, !report.dependency_optimizations.is_empty());
        Ok(OptimizationOutcome {
            report,
            applied,
            estimated_improvement,
            warnings,
        })
    }

    /// Reports a late failure of an execution that already succeeded.
    ///
    /// The execution is invalidated and routed through failure recovery;
    /// a retry escalates to a rollback of every succeeded consumer of its
    /// output. Only runs that are running or paused accept this.
    pub fn invalidate_execution(
        &self,
        run_id: Uuid,
        kind: &str,
        error: &str,
    ) -> Result<RecoveryOutcome> {
        let handle = self.handle(run_id)?;
        let (id, report) = {
            let mut run = handle.run.lock();
            if !run.status.is_active() {
                return Err(OrchestrationError::InvalidRunState {
                    run_id,
                    status: run.status,
                    action: "invalidate an execution of",
                });
            }
            let id = run
                .execution_by_kind(kind)
                .map(|e| e.id)
                .ok_or_else(|| OrchestrationError::ExecutionNotFound {
                    run_id,
                    kind: kind.to_string(),
                })?;
            if let Some(exec) = run.execution_mut(id) {
                exec.invalidate(error)?;
            }
            self.inner.recovery.record_attempt_failure(kind);
            let fault = ExecutionFault::Handler(error.to_string());
            let report = self.inner.recovery.handle_execution_failure(&mut run, id, &fault)?;
            if let RecoveryOutcome::Retry { delay } = report.outcome {
                if let Some(at) = Instant::now().checked_add(delay) {
                    handle.retry_requests.lock().push((id, at));
                }
            }
            (id, report)
        };

        warn!(
            run_id = %run_id,
            kind,
            strategy = %report.strategy,
            rolled_back = report.rolled_back.len(),
            "Execution invalidated"
        );
        handle.emitter.emit_for(
            id,
            EventType::ExecutionFailed,
            json!({
                "kind": kind,
                "error": error,
                "invalidated": true,
                "strategy": report.strategy.to_string(),
                "rolled_back": report.rolled_back.len(),
            }),
        );
        match &report.outcome {
            RecoveryOutcome::Retry { delay } => handle.emitter.emit_for(
                id,
                EventType::ExecutionRetrying,
                json!({
                    "kind": kind,
                    "delay_ms": delay.as_millis() as u64,
                    "strategy": report.strategy.to_string(),
                }),
            ),
            RecoveryOutcome::Resolved => handle.emitter.emit_for(
                id,
                EventType::ExecutionCompleted,
                json!({"kind": kind, "skipped": true, "strategy": report.strategy.to_string()}),
            ),
            RecoveryOutcome::Fallback { fallback_kind } => {
                handle.fallback_requests.lock().push((id, fallback_kind.clone()));
            }
            RecoveryOutcome::Terminal { intervention } => {
                if let Some(record) = intervention {
                    handle.emitter.emit_for(
                        id,
                        EventType::InterventionRequired,
                        serde_json::to_value(record).unwrap_or_default(),
                    );
                }
            }
        }
        handle.wake.notify_one();
        Ok(report.outcome)
    }

    /// Drops a finished run and its monitoring state.
    pub fn forget_run(&self, run_id: Uuid) -> Result<()> {
        let handle = self.handle(run_id)?;
        let status = handle.status();
        if !status.is_terminal() {
            return Err(OrchestrationError::InvalidRunState {
                run_id,
                status,
                action: "forget",
            });
        }
        self.inner.runs.write().remove(&run_id);
        self.inner.monitor.forget(run_id);
        info!(run_id = %run_id, "Pipeline run forgotten");
        Ok(())
    }

    /// Circuit breaker status per kind.
    #[must_use]
    pub fn circuit_status(&self) -> BTreeMap<String, CircuitStatus> {
        self.inner.recovery.circuit_status()
    }

    /// Forces the breaker of `kind` closed.
    pub fn reset_circuit_breaker(&self, kind: &str) -> bool {
        self.inner.recovery.reset_circuit_breaker(kind)
    }

    fn active_count(&self) -> usize {
        let handles: Vec<Arc<RunHandle>> = self.inner.runs.read().values().cloned().collect();
        handles.iter().filter(|h| !h.status().is_terminal()).count()
    }

    /// Executor-wide counters.
    #[must_use]
    pub fn executor_metrics(&self) -> ExecutorMetrics {
        let active_pipelines = self.active_count();
        let total_runs = self.inner.runs.read().len();
        let stats = self.inner.stats.lock();
        let executed = stats.pipelines_executed;
        let rate = |n: u64| if executed == 0 { 0.0 } else { n as f64 / executed as f64 * 100.0 };
        ExecutorMetrics {
            pipelines_executed: executed,
            successful_pipelines: stats.successful,
            partial_pipelines: stats.partial,
            failed_pipelines: stats.failed,
            cancelled_pipelines: stats.cancelled,
            success_rate: rate(stats.successful),
            failure_rate: rate(stats.failed),
            average_pipeline_duration_secs: if executed == 0 {
                0.0
            } else {
                stats.total_duration_secs / executed as f64
            },
            units_executed: stats.units_executed,
            active_pipelines,
            total_runs,
            recovery: self.inner.recovery.stats(),
            validation: self.inner.validation.snapshot(),
        }
    }

    /// Scores load, run failures and recovery effectiveness.
    #[must_use]
    pub fn health_check(&self) -> HealthReport {
        let metrics = self.executor_metrics();
        let recovery = self.inner.recovery.health();
        let max_parallel = self.inner.config.max_parallel_agents;
        let mut score: u8 = 100;
        let mut issues = Vec::new();

        if metrics.active_pipelines > max_parallel * 2 {
            score = score.saturating_sub(20);
            issues.push(format!("High load: {} active pipelines", metrics.active_pipelines));
        }
        if metrics.failure_rate > 20.0 {
            score = score.saturating_sub(30);
            issues.push(format!("High pipeline failure rate: {:.1}%", metrics.failure_rate));
        }
        if recovery.total_failures > 0 && recovery.success_rate < 50.0 {
            score = score.saturating_sub(15);
            issues.push(format!("Low recovery success rate: {:.1}%", recovery.success_rate));
        }

        HealthReport {
            status: HealthStatus::from_score(score),
            health_score: score,
            issues,
            active_pipelines: metrics.active_pipelines,
            max_parallel_agents: max_parallel,
            registered_kinds: self.inner.registry.kinds(),
            recovery,
            monitor: self.inner.monitor.health_check(),
            validation_healthy: self.inner.validation.is_healthy(),
        }
    }
}

impl fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("max_parallel_agents", &self.inner.config.max_parallel_agents)
            .field("handlers", &self.inner.registry.len())
            .field("runs", &self.inner.runs.read().len())
            .finish()
    }
}
