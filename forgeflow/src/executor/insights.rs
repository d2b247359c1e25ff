//! Post-hoc views of a run.

use crate::core::{ExecutionStatus, PipelineRun, PipelineStatus};
use crate::monitor::PerformanceAnalysis;
use crate::recovery::RecoveryStrategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Below this share of the run's mean duration an execution is fast.
const FAST_RATIO: f64 = 0.8;
/// Above this share of the run's mean duration an execution is slow.
const SLOW_RATIO: f64 = 1.2;

/// Duration of an execution relative to the run's mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceRating {
    /// Under 80% of the mean.
    Fast,
    /// Within 80%..=120% of the mean.
    Normal,
    /// Over 120% of the mean.
    Slow,
}

/// Headline numbers of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightSummary {
    /// Run name.
    pub name: String,
    /// Status.
    pub status: PipelineStatus,
    /// Progress.
    pub progress_percentage: f64,
    /// Executions in the run.
    pub total_executions: usize,
    /// Succeeded.
    pub completed: usize,
    /// Failed.
    pub failed: usize,
    /// Retries across executions.
    pub retry_count: u32,
    /// Mean duration of executions that finished an attempt.
    pub average_duration_secs: f64,
    /// Wall-clock time so far.
    pub elapsed_secs: f64,
}

/// What one execution did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInsight {
    /// Status.
    pub status: ExecutionStatus,
    /// Attempts made.
    pub attempts: u32,
    /// Last attempt's duration.
    pub duration_secs: Option<f64>,
    /// Declared dependencies.
    pub dependencies: Vec<String>,
    /// Executions that directly depend on this one.
    pub blocking_executions: usize,
    /// Recovery strategy applied, if any.
    pub recovery_strategy: Option<RecoveryStrategy>,
    /// Last error.
    pub last_error: Option<String>,
    /// Rating, for executions with a duration.
    pub performance: Option<PerformanceRating>,
}

/// One execution on the run's timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// Kind.
    pub kind: String,
    /// Start of the last attempt.
    pub started_at: DateTime<Utc>,
    /// End of the last attempt, if finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Duration of the last attempt.
    pub duration_secs: Option<f64>,
    /// Status.
    pub status: ExecutionStatus,
}

/// Everything [`PipelineExecutor::insights`](super::PipelineExecutor::insights) returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineInsights {
    /// Headline numbers.
    pub summary: InsightSummary,
    /// Per-kind insight.
    pub executions: BTreeMap<String, ExecutionInsight>,
    /// Started executions ordered by start time.
    pub timeline: Vec<TimelineEntry>,
    /// Monitor trend analysis.
    pub performance: PerformanceAnalysis,
}

fn rate(duration: f64, average: f64) -> PerformanceRating {
    if duration < average * FAST_RATIO {
        PerformanceRating::Fast
    } else if duration > average * SLOW_RATIO {
        PerformanceRating::Slow
    } else {
        PerformanceRating::Normal
    }
}

pub(super) fn build(run: &PipelineRun, performance: PerformanceAnalysis) -> PipelineInsights {
    let durations: Vec<f64> = run.executions.iter().filter_map(|e| e.duration_secs).collect();
    let average = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<f64>() / durations.len() as f64
    };

    let executions = run
        .executions
        .iter()
        .map(|exec| {
            let blocking_executions = run
                .executions
                .iter()
                .filter(|other| other.depends_on.contains(&exec.kind))
                .count();
            let insight = ExecutionInsight {
                status: exec.status,
                attempts: exec.attempt_number,
                duration_secs: exec.duration_secs,
                dependencies: exec.depends_on.clone(),
                blocking_executions,
                recovery_strategy: exec.recovery_strategy,
                last_error: exec.last_error.clone(),
                performance: exec
                    .duration_secs
                    .filter(|_| average > 0.0)
                    .map(|d| rate(d, average)),
            };
            (exec.kind.clone(), insight)
        })
        .collect();

    let mut timeline: Vec<TimelineEntry> = run
        .executions
        .iter()
        .filter_map(|exec| {
            exec.started_at.map(|started_at| TimelineEntry {
                kind: exec.kind.clone(),
                started_at,
                completed_at: exec.completed_at,
                duration_secs: exec.duration_secs,
                status: exec.status,
            })
        })
        .collect();
    timeline.sort_by_key(|entry| entry.started_at);

    PipelineInsights {
        summary: InsightSummary {
            name: run.name.clone(),
            status: run.status,
            progress_percentage: run.progress_percentage,
            total_executions: run.executions.len(),
            completed: run.completed_count,
            failed: run.failed_count,
            retry_count: run.retry_count(),
            average_duration_secs: average,
            elapsed_secs: run.elapsed_secs(),
        },
        executions,
        timeline,
        performance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestrationConfig;
    use crate::core::{PipelineSubmission, WorkOutput};
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn finished(run: &mut PipelineRun, index: usize, start_offset: i64, secs: f64) {
        let exec = &mut run.executions[index];
        exec.mark_started().unwrap();
        exec.mark_completed(WorkOutput::new(json!(null))).unwrap();
        exec.started_at = Some(Utc::now() - Duration::seconds(start_offset));
        exec.duration_secs = Some(secs);
    }

    #[test]
    fn test_ratings_relative_to_average() {
        let submission = PipelineSubmission::sequence("i", "brief", ["a", "b", "c"]);
        let mut run = PipelineRun::from_submission(&submission, &OrchestrationConfig::default());
        finished(&mut run, 0, 30, 1.0);
        finished(&mut run, 1, 20, 2.0);
        finished(&mut run, 2, 10, 6.0);
        run.update_progress();

        // Mean 3.0: fast below 2.4, slow above 3.6.
        let insights = build(&run, PerformanceAnalysis::default());
        assert_eq!(insights.summary.average_duration_secs, 3.0);
        assert_eq!(insights.executions["a"].performance, Some(PerformanceRating::Fast));
        assert_eq!(insights.executions["b"].performance, Some(PerformanceRating::Fast));
        assert_eq!(insights.executions["c"].performance, Some(PerformanceRating::Slow));
        assert_eq!(insights.executions["a"].blocking_executions, 1);
        assert_eq!(insights.executions["c"].blocking_executions, 0);

        let order: Vec<&str> = insights.timeline.iter().map(|t| t.kind.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_unstarted_run_has_no_ratings() {
        let submission = PipelineSubmission::sequence("i", "brief", ["a"]);
        let run = PipelineRun::from_submission(&submission, &OrchestrationConfig::default());
        let insights = build(&run, PerformanceAnalysis::default());
        assert!(insights.timeline.is_empty());
        assert_eq!(insights.executions["a"].performance, None);
        assert_eq!(rate(3.0, 3.0), PerformanceRating::Normal);
    }
}
