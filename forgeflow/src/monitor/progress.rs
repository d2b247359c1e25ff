//! Progress and ETA.

use crate::core::{ExecutionStatus, PipelineRun};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Progress of one run at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Executions in the run.
    pub total: usize,
    /// Succeeded executions.
    pub completed: usize,
    /// Terminally failed executions.
    pub failed: usize,
    /// Executions currently running.
    pub running: usize,
    /// `100 * completed / total`.
    pub progress_percentage: f64,
    /// Seconds left, extrapolated from elapsed time per percent.
    pub eta_secs: Option<f64>,
    /// `now + eta_secs`.
    pub estimated_completion: Option<DateTime<Utc>>,
    /// Completions per minute since the run started.
    pub throughput_per_minute: f64,
    /// Snapshot time.
    pub last_updated: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// Computes progress for `run` as of `now`.
    #[must_use]
    pub fn from_run(run: &PipelineRun, now: DateTime<Utc>) -> Self {
        let elapsed_secs = run
            .started_at
            .map_or(0.0, |start| (now - start).num_milliseconds() as f64 / 1000.0);
        let eta_secs = estimate_remaining_secs(run.progress_percentage, elapsed_secs);
        let running = run
            .executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Running)
            .count();
        let throughput_per_minute = if elapsed_secs > 0.0 {
            run.completed_count as f64 / (elapsed_secs / 60.0)
        } else {
            0.0
        };
        Self {
            total: run.executions.len(),
            completed: run.completed_count,
            failed: run.failed_count,
            running,
            progress_percentage: run.progress_percentage,
            eta_secs,
            estimated_completion: eta_secs
                .map(|secs| now + Duration::milliseconds((secs * 1000.0) as i64)),
            throughput_per_minute,
            last_updated: now,
        }
    }
}

/// Seconds remaining given `progress` percent done after `elapsed_secs`.
///
/// `None` before any progress or once the run is done.
#[must_use]
pub fn estimate_remaining_secs(progress: f64, elapsed_secs: f64) -> Option<f64> {
    if progress <= 0.0 || progress >= 100.0 || elapsed_secs <= 0.0 {
        return None;
    }
    Some((100.0 - progress) * (elapsed_secs / progress))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestrationConfig;
    use crate::core::{PipelineSubmission, WorkOutput};
    use serde_json::json;

    #[test]
    fn test_estimate_remaining() {
        assert_eq!(estimate_remaining_secs(25.0, 10.0), Some(30.0));
        assert_eq!(estimate_remaining_secs(0.0, 10.0), None);
        assert_eq!(estimate_remaining_secs(100.0, 10.0), None);
    }

    #[test]
    fn test_progress_from_run() {
        let submission = PipelineSubmission::sequence("p", "brief", ["a", "b", "c", "d"]);
        let mut run = PipelineRun::from_submission(&submission, &OrchestrationConfig::default());
        let now = Utc::now();
        run.started_at = Some(now - Duration::seconds(20));
        run.executions[0].mark_started().unwrap();
        run.executions[0].mark_completed(WorkOutput::new(json!(null))).unwrap();
        run.executions[1].mark_started().unwrap();
        run.update_progress();

        let progress = ProgressSnapshot::from_run(&run, now);
        assert_eq!(progress.total, 4);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.running, 1);
        assert_eq!(progress.progress_percentage, 25.0);
        assert_eq!(progress.eta_secs, Some(60.0));
        assert_eq!(progress.throughput_per_minute, 3.0);
        assert!(progress.estimated_completion.is_some());
    }
}
