//! # Forgeflow
//!
//! A dependency-aware orchestration engine for runs of cooperating work
//! units (agents, tools, build steps).
//!
//! Forgeflow provides:
//!
//! - **Dependency analysis**: cycle detection, topological levels and critical paths
//! - **Scheduling**: pluggable ordering strategies over a bounded resource pool
//! - **Failure recovery**: classified failures, backoff, fallbacks and circuit breakers
//! - **Monitoring**: progress, metrics history and threshold alerts
//! - **Run control**: pause, resume, cancel and late invalidation of results
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use forgeflow::prelude::*;
//!
//! let registry = HandlerRegistry::new()
//!     .with_handler("plan", Arc::new(PlanHandler))
//!     .with_handler("build", Arc::new(BuildHandler));
//! let executor = PipelineExecutor::new(OrchestrationConfig::default(), Arc::new(registry))?;
//!
//! let submission = PipelineSubmission::sequence("release", "ship v2", ["plan", "build"]);
//! let result = executor.run(submission).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss
)]

pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod executor;
pub mod graph;
pub mod handlers;
pub mod monitor;
pub mod recovery;
pub mod scheduler;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{
        CircuitBreakerConfig, OrchestrationConfig, RecoveryConfig, RunConfigOverrides,
    };
    pub use crate::core::{
        ExecutionStatus, PipelineResult, PipelineRun, PipelineStatus, PipelineSubmission,
        ResourceRequirements, RetryStrategy, WorkOutput, WorkUnitSpec,
    };
    pub use crate::errors::{HandlerError, OrchestrationError, Result};
    pub use crate::events::{
        EventSink, EventType, LoggingEventSink, NoOpEventSink, OrchestrationEvent,
    };
    pub use crate::executor::{ExecutorBuilder, HealthStatus, PipelineExecutor};
    pub use crate::handlers::{HandlerInput, HandlerRegistry, WorkUnitHandler};
    pub use crate::recovery::{RecoveryOutcome, RecoveryStrategy};
    pub use crate::scheduler::StrategyKind;
    pub use std::sync::Arc;
}
