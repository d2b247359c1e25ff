//! Background observation of running pipelines.
//!
//! A [`PipelineMonitor`] keeps, for every registered run, a
//! [`MetricCollector`], a [`ProgressSnapshot`], an [`AlertManager`] and a
//! bounded history of [`MonitorSnapshot`]s. The executor spawns one polling
//! task per run with [`PipelineMonitor::spawn`]; the task only reads the
//! run and never changes execution outcomes.

mod alerts;
mod metrics;
mod progress;

pub use alerts::{Alert, AlertKind, AlertManager};
pub use metrics::{KindErrorRate, MetricCollector, MetricsSnapshot};
pub use progress::{estimate_remaining_secs, ProgressSnapshot};

use crate::cancellation::CancellationToken;
use crate::config::{AlertThresholds, OrchestrationConfig};
use crate::core::{PipelineRun, PipelineStatus};
use crate::events::{EventType, RunEmitter};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Snapshots returned by [`PipelineMonitor::history`] when no limit is given.
pub const DEFAULT_HISTORY_QUERY_LIMIT: usize = 100;

/// Snapshots considered by trend analysis.
const TREND_WINDOW: usize = 10;

/// Retry rate (percent) above which a run is reported as unstable.
const UNSTABLE_RETRY_RATE: f64 = 25.0;

/// Per-run monitoring parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    /// Polling interval of the background task.
    pub interval: Duration,
    /// Execution timeout used by runtime alerts.
    pub execution_timeout_secs: f64,
    /// Alert thresholds.
    pub thresholds: AlertThresholds,
    /// Snapshots retained per run.
    pub history_limit: usize,
    /// Compute progress and ETA.
    pub progress_tracking: bool,
}

impl MonitorSettings {
    /// Derives settings from a (run-effective) configuration.
    #[must_use]
    pub fn from_config(config: &OrchestrationConfig) -> Self {
        Self {
            interval: config.monitoring_interval(),
            execution_timeout_secs: config.execution_timeout_secs,
            thresholds: config.alerts.clone(),
            history_limit: config.history_limit.max(1),
            progress_tracking: config.enable_progress_tracking,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from_config(&OrchestrationConfig::default())
    }
}

/// One entry of a run's monitoring history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    /// Snapshot time.
    pub timestamp: DateTime<Utc>,
    /// Run status.
    pub pipeline_status: PipelineStatus,
    /// Run progress.
    pub progress_percentage: f64,
    /// Executions holding a slot.
    pub currently_running: usize,
    /// The run's parallelism ceiling.
    pub max_parallel: usize,
    /// Succeeded executions.
    pub completed: usize,
    /// Failed executions.
    pub failed: usize,
    /// Counters at this instant.
    pub metrics: MetricsSnapshot,
}

/// Current metrics of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Run id.
    pub run_id: Uuid,
    /// Counters.
    pub metrics: MetricsSnapshot,
    /// Progress, when tracking is enabled.
    pub progress: Option<ProgressSnapshot>,
    /// Snapshots retained.
    pub history_length: usize,
    /// Alerts raised so far.
    pub alerts_raised: usize,
}

/// Trend analysis over a run's recent history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAnalysis {
    /// Progress of the last snapshots, oldest first.
    pub progress_trend: Vec<f64>,
    /// Throughput of the last snapshots, oldest first.
    pub throughput_trend: Vec<f64>,
    /// Detected bottlenecks.
    pub bottlenecks: Vec<String>,
    /// Snapshots retained.
    pub total_snapshots: usize,
    /// Time between the first and last retained snapshot.
    pub monitoring_duration_secs: f64,
}

/// Monitor health summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorHealth {
    /// Always `healthy`; the monitor has no failure modes of its own.
    pub status: String,
    /// Polling tasks alive.
    pub active_monitors: usize,
    /// Runs with retained state.
    pub runs_tracked: usize,
    /// Alerts raised across tracked runs.
    pub total_alerts: usize,
}

#[derive(Debug)]
struct RunState {
    settings: MonitorSettings,
    collector: MetricCollector,
    alerts: AlertManager,
    progress: Option<ProgressSnapshot>,
    history: VecDeque<MonitorSnapshot>,
    alert_history: Vec<Alert>,
}

impl RunState {
    fn refresh(&mut self, run: &PipelineRun, now: DateTime<Utc>) -> MetricsSnapshot {
        self.collector.observe(run);
        if self.settings.progress_tracking {
            self.progress = Some(ProgressSnapshot::from_run(run, now));
        }
        self.collector.snapshot(now)
    }
}

struct MonitorTask {
    stop: Arc<CancellationToken>,
    handle: JoinHandle<()>,
}

/// Engine-wide monitor holding per-run state.
#[derive(Default)]
pub struct PipelineMonitor {
    runs: Mutex<HashMap<Uuid, RunState>>,
    tasks: Mutex<HashMap<Uuid, MonitorTask>>,
}

impl PipelineMonitor {
    /// Creates an empty monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `run`. Registering again resets its state.
    pub fn register(&self, run: &PipelineRun, settings: MonitorSettings) {
        let state = RunState {
            collector: MetricCollector::new(run.started_at.unwrap_or_else(Utc::now)),
            alerts: AlertManager::new(settings.thresholds.clone(), settings.execution_timeout_secs),
            settings,
            progress: None,
            history: VecDeque::new(),
            alert_history: Vec::new(),
        };
        self.runs.lock().insert(run.id, state);
    }

    /// True if `run_id` is tracked.
    #[must_use]
    pub fn is_tracking(&self, run_id: Uuid) -> bool {
        self.runs.lock().contains_key(&run_id)
    }

    /// Records `run`'s state, appends a history snapshot and returns the
    /// alerts newly raised. Untracked runs are ignored.
    pub fn observe(&self, run: &PipelineRun) -> Vec<Alert> {
        let now = Utc::now();
        let mut runs = self.runs.lock();
        let Some(state) = runs.get_mut(&run.id) else {
            return Vec::new();
        };
        let metrics = state.refresh(run, now);
        let alerts = state.alerts.check(run, &metrics, now);
        state.alert_history.extend(alerts.iter().cloned());

        state.history.push_back(MonitorSnapshot {
            timestamp: now,
            pipeline_status: run.status,
            progress_percentage: run.progress_percentage,
            currently_running: run.currently_running,
            max_parallel: run.max_parallel,
            completed: run.completed_count,
            failed: run.failed_count,
            metrics,
        });
        while state.history.len() > state.settings.history_limit {
            state.history.pop_front();
        }
        alerts
    }

    /// Current metrics of `run`, refreshed from its state without touching
    /// history or alerts.
    #[must_use]
    pub fn metrics(&self, run: &PipelineRun) -> Option<RunMetrics> {
        let now = Utc::now();
        let mut runs = self.runs.lock();
        let state = runs.get_mut(&run.id)?;
        let metrics = state.refresh(run, now);
        Some(RunMetrics {
            run_id: run.id,
            metrics,
            progress: state.progress.clone(),
            history_length: state.history.len(),
            alerts_raised: state.alert_history.len(),
        })
    }

    /// The last `limit` snapshots, oldest first.
    ///
    /// `None` means [`DEFAULT_HISTORY_QUERY_LIMIT`]; `Some(0)` returns all.
    #[must_use]
    pub fn history(&self, run_id: Uuid, limit: Option<usize>) -> Vec<MonitorSnapshot> {
        let runs = self.runs.lock();
        let Some(state) = runs.get(&run_id) else {
            return Vec::new();
        };
        let limit = match limit.unwrap_or(DEFAULT_HISTORY_QUERY_LIMIT) {
            0 => state.history.len(),
            n => n,
        };
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    /// Alerts raised for `run_id`, oldest first.
    #[must_use]
    pub fn alerts(&self, run_id: Uuid) -> Vec<Alert> {
        self.runs
            .lock()
            .get(&run_id)
            .map(|s| s.alert_history.clone())
            .unwrap_or_default()
    }

    /// Trends and bottlenecks from the retained history.
    #[must_use]
    pub fn performance_analysis(&self, run_id: Uuid) -> PerformanceAnalysis {
        let runs = self.runs.lock();
        let Some(state) = runs.get(&run_id) else {
            return PerformanceAnalysis::default();
        };
        let history = &state.history;
        let (Some(first), Some(last)) = (history.front(), history.back()) else {
            return PerformanceAnalysis::default();
        };

        let window = history.iter().skip(history.len().saturating_sub(TREND_WINDOW));
        let (progress_trend, throughput_trend): (Vec<f64>, Vec<f64>) = window
            .map(|s| (s.progress_percentage, s.metrics.throughput_per_minute))
            .unzip();

        let mut bottlenecks = Vec::new();
        if !last.pipeline_status.is_terminal() && last.currently_running < last.max_parallel {
            bottlenecks.push("Under-utilized parallel capacity".to_string());
        }
        if last.metrics.retry_rate > UNSTABLE_RETRY_RATE {
            bottlenecks.push("High retry rate indicating instability".to_string());
        }

        PerformanceAnalysis {
            progress_trend,
            throughput_trend,
            bottlenecks,
            total_snapshots: history.len(),
            monitoring_duration_secs: (last.timestamp - first.timestamp).num_milliseconds() as f64
                / 1000.0,
        }
    }

    /// Spawns the polling task for a registered run.
    ///
    /// The task observes the run every interval and publishes alerts until
    /// [`stop`](Self::stop) is called.
    pub fn spawn(
        self: &Arc<Self>,
        run_id: Uuid,
        run: Arc<Mutex<PipelineRun>>,
        emitter: Arc<RunEmitter>,
    ) {
        let Some(interval) = self.runs.lock().get(&run_id).map(|s| s.settings.interval) else {
            warn!(run_id = %run_id, "Monitor spawn requested for untracked run");
            return;
        };
        let stop = Arc::new(CancellationToken::new());
        let monitor = Arc::clone(self);
        let task_stop = Arc::clone(&stop);
        let handle = tokio::spawn(
            async move {
                loop {
                    let snapshot = run.lock().clone();
                    let alerts = monitor.observe(&snapshot);
                    publish_alerts(&emitter, &alerts);
                    tokio::select! {
                        () = task_stop.cancelled() => break,
                        () = tokio::time::sleep(interval) => {}
                    }
                }
                debug!("Monitor loop exited");
            }
            .instrument(info_span!("monitor", run_id = %run_id)),
        );

        if let Some(previous) = self.tasks.lock().insert(run_id, MonitorTask { stop, handle }) {
            previous.stop.cancel("replaced");
        }
        info!(run_id = %run_id, interval_ms = interval.as_millis() as u64, "Monitoring started");
    }

    /// Stops the polling task of `run_id` and waits for it to exit.
    pub async fn stop(&self, run_id: Uuid) {
        let task = self.tasks.lock().remove(&run_id);
        if let Some(task) = task {
            task.stop.cancel("run finished");
            if let Err(err) = task.handle.await {
                warn!(run_id = %run_id, error = %err, "Monitor task ended abnormally");
            }
            info!(run_id = %run_id, "Monitoring stopped");
        }
    }

    /// Drops all state kept for `run_id`.
    pub fn forget(&self, run_id: Uuid) {
        if let Some(task) = self.tasks.lock().remove(&run_id) {
            task.stop.cancel("forgotten");
        }
        self.runs.lock().remove(&run_id);
    }

    /// Health summary.
    #[must_use]
    pub fn health_check(&self) -> MonitorHealth {
        let runs = self.runs.lock();
        MonitorHealth {
            status: "healthy".to_string(),
            active_monitors: self.tasks.lock().len(),
            runs_tracked: runs.len(),
            total_alerts: runs.values().map(|s| s.alert_history.len()).sum(),
        }
    }
}

impl std::fmt::Debug for PipelineMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMonitor")
            .field("runs_tracked", &self.runs.lock().len())
            .field("active_monitors", &self.tasks.lock().len())
            .finish()
    }
}

/// Forwards alerts to the run's event stream.
pub fn publish_alerts(emitter: &RunEmitter, alerts: &[Alert]) {
    for alert in alerts {
        warn!(
            kind = %alert.kind,
            run_id = %alert.run_id,
            value = alert.value,
            threshold = alert.threshold,
            "{}", alert.message
        );
        let payload = serde_json::to_value(alert).unwrap_or_default();
        match alert.execution_id {
            Some(id) => emitter.emit_for(id, EventType::AlertRaised, payload),
            None => emitter.emit(EventType::AlertRaised, payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PipelineSubmission, WorkOutput};
    use crate::events::CollectingEventSink;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn run() -> PipelineRun {
        let submission = PipelineSubmission::sequence("monitor", "brief", ["a", "b"]);
        let mut run = PipelineRun::from_submission(&submission, &OrchestrationConfig::default());
        run.mark_started();
        run
    }

    fn settings(history_limit: usize) -> MonitorSettings {
        MonitorSettings {
            interval: Duration::from_millis(10),
            history_limit,
            ..MonitorSettings::default()
        }
    }

    #[test]
    fn test_untracked_run_is_ignored() {
        let monitor = PipelineMonitor::new();
        let run = run();
        assert!(monitor.observe(&run).is_empty());
        assert!(monitor.metrics(&run).is_none());
        assert!(monitor.history(run.id, None).is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let monitor = PipelineMonitor::new();
        let run = run();
        monitor.register(&run, settings(3));
        for _ in 0..5 {
            monitor.observe(&run);
        }
        assert_eq!(monitor.history(run.id, None).len(), 3);
        assert_eq!(monitor.history(run.id, Some(2)).len(), 2);
        assert_eq!(monitor.history(run.id, Some(0)).len(), 3);
    }

    #[test]
    fn test_metrics_and_progress() {
        let monitor = PipelineMonitor::new();
        let mut run = run();
        monitor.register(&run, settings(10));
        run.executions[0].mark_started().unwrap();
        run.executions[0].mark_completed(WorkOutput::new(json!(1))).unwrap();
        run.update_progress();

        let metrics = monitor.metrics(&run).unwrap();
        assert_eq!(metrics.metrics.executions_completed, 1);
        assert_eq!(metrics.progress.unwrap().progress_percentage, 50.0);
        assert_eq!(metrics.history_length, 0);
    }

    #[test]
    fn test_performance_analysis_reports_idle_capacity() {
        let monitor = PipelineMonitor::new();
        let run = run();
        monitor.register(&run, settings(50));
        for _ in 0..12 {
            monitor.observe(&run);
        }
        let analysis = monitor.performance_analysis(run.id);
        assert_eq!(analysis.total_snapshots, 12);
        assert_eq!(analysis.progress_trend.len(), 10);
        assert_eq!(analysis.bottlenecks, vec!["Under-utilized parallel capacity".to_string()]);
    }

    #[test]
    fn test_alerts_recorded_and_published() {
        let monitor = PipelineMonitor::new();
        let mut run = run();
        monitor.register(&run, settings(10));
        let exec = &mut run.executions[0];
        exec.mark_started().unwrap();
        exec.mark_failed("boom").unwrap();
        exec.mark_terminal_failure(None).unwrap();

        let alerts = monitor.observe(&run);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::HighFailureRate);
        assert_eq!(monitor.alerts(run.id).len(), 1);

        let sink = Arc::new(CollectingEventSink::new());
        let emitter = RunEmitter::new(run.id, sink.clone());
        publish_alerts(&emitter, &alerts);
        assert_eq!(sink.events_of_type("alert.").len(), 1);
    }

    #[tokio::test]
    async fn test_background_task_polls_until_stopped() {
        let monitor = Arc::new(PipelineMonitor::new());
        let run = run();
        let run_id = run.id;
        monitor.register(&run, settings(100));
        let shared = Arc::new(Mutex::new(run));
        let emitter = Arc::new(RunEmitter::new(run_id, Arc::new(CollectingEventSink::new())));

        monitor.spawn(run_id, shared, emitter);
        assert_eq!(monitor.health_check().active_monitors, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop(run_id).await;

        assert!(!monitor.history(run_id, None).is_empty());
        assert_eq!(monitor.health_check().active_monitors, 0);
        monitor.forget(run_id);
        assert!(!monitor.is_tracking(run_id));
    }
}
