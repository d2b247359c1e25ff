//! Execution, pipeline and retry status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The status of a single work-unit execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Waiting for dependencies or a scheduling slot.
    #[default]
    Pending,
    /// Ready but waiting in the scheduler's overflow queue.
    Queued,
    /// The handler is running.
    Running,
    /// Completed successfully.
    Success,
    /// The attempt failed.
    Failure,
    /// Cancelled before completing.
    Cancelled,
    /// Transitional state between a failed attempt and the next one.
    Retry,
    /// The handler exceeded its allotted time.
    Timeout,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Retry => write!(f, "retry"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

impl ExecutionStatus {
    /// Returns true if the status is terminal for the run's bookkeeping.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Cancelled)
    }

    /// Returns true if the execution has not started its current attempt.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Pending | Self::Queued)
    }

    /// Returns true if the attempt ended in a failure that recovery may act on.
    #[must_use]
    pub fn is_failed_attempt(&self) -> bool {
        matches!(self, Self::Failure | Self::Timeout)
    }

    /// Returns true if `next` is a legal successor of this status.
    ///
    /// Pending is re-entered only through `Retry`, or from `Success` when a
    /// rollback invalidates consumed output.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use ExecutionStatus::{Cancelled, Failure, Pending, Queued, Retry, Running, Success, Timeout};
        match self {
            Pending => matches!(next, Queued | Running | Cancelled | Failure),
            Queued => matches!(next, Pending | Running | Cancelled),
            Running => matches!(next, Success | Failure | Timeout | Cancelled),
            Failure | Timeout => matches!(next, Retry | Success | Failure | Cancelled),
            Retry => matches!(next, Pending | Cancelled),
            Success => matches!(next, Pending | Failure),
            Cancelled => false,
        }
    }
}

/// The status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Created but not started.
    #[default]
    Created,
    /// Accepted and waiting to start.
    Queued,
    /// The executor loop is driving the run.
    Running,
    /// New launches are suspended.
    Paused,
    /// Every execution succeeded.
    Success,
    /// No execution succeeded.
    Failure,
    /// Cancelled by a caller.
    Cancelled,
    /// Some executions succeeded and some did not.
    PartialSuccess,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::PartialSuccess => write!(f, "partial_success"),
        }
    }
}

impl PipelineStatus {
    /// Returns true if the run has finished.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::Cancelled | Self::PartialSuccess
        )
    }

    /// Returns true if the run is being driven (running or paused).
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

/// How the delay before a retry is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Never retry.
    None,
    /// Retry without delay.
    Immediate,
    /// delay = base * 2^(attempt - 1)
    #[default]
    ExponentialBackoff,
    /// delay = base * attempt
    LinearBackoff,
    /// delay = base
    FixedDelay,
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Immediate => write!(f, "immediate"),
            Self::ExponentialBackoff => write!(f, "exponential_backoff"),
            Self::LinearBackoff => write!(f, "linear_backoff"),
            Self::FixedDelay => write!(f, "fixed_delay"),
        }
    }
}

/// Severity shared by failure analysis, optimization suggestions and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    #[default]
    Low,
    /// Worth attention.
    Medium,
    /// Likely to affect the run.
    High,
    /// Requires immediate action.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::Failure.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Timeout.is_terminal());
        assert!(!ExecutionStatus::Retry.is_terminal());
        assert!(PipelineStatus::PartialSuccess.is_terminal());
        assert!(!PipelineStatus::Paused.is_terminal());
    }

    #[test]
    fn test_pending_reentered_only_through_retry() {
        assert!(!ExecutionStatus::Failure.can_transition_to(ExecutionStatus::Pending));
        assert!(!ExecutionStatus::Timeout.can_transition_to(ExecutionStatus::Pending));
        assert!(ExecutionStatus::Failure.can_transition_to(ExecutionStatus::Retry));
        assert!(ExecutionStatus::Retry.can_transition_to(ExecutionStatus::Pending));
        assert!(!ExecutionStatus::Running.can_transition_to(ExecutionStatus::Pending));
    }

    #[test]
    fn test_cancelled_is_final() {
        for next in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Success,
        ] {
            assert!(!ExecutionStatus::Cancelled.can_transition_to(next));
        }
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&PipelineStatus::PartialSuccess).unwrap();
        assert_eq!(json, "\"partial_success\"");
        let strategy: RetryStrategy = serde_json::from_str("\"linear_backoff\"").unwrap();
        assert_eq!(strategy, RetryStrategy::LinearBackoff);
    }
}
