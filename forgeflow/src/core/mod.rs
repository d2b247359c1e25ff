//! Core domain model types for forgeflow.
//!
//! This module contains the data the engine moves around:
//! - Execution, pipeline and retry status enums
//! - The attempt-tracked work-unit execution
//! - The pipeline run aggregate and its final result
//! - Submission types used to create runs

mod execution;
mod output;
mod result;
mod run;
mod status;
mod submission;

pub use execution::{
    AttemptRecord, ResourceRequirements, WorkUnitExecution, DEFAULT_ESTIMATED_DURATION_SECS,
    DEFAULT_PRIORITY,
};
pub use output::WorkOutput;
pub use result::{ExecutionSummary, PipelineResult};
pub use run::PipelineRun;
pub use status::{ExecutionStatus, PipelineStatus, RetryStrategy, Severity};
pub use submission::{PipelineSubmission, WorkUnitSpec};
