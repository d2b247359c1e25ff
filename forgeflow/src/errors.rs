//! Error types for the forgeflow orchestration engine.
//!
//! Dependency problems are reported before a run starts, execution-level
//! problems are described by [`ExecutionFault`] and routed through failure
//! recovery, and everything a caller can observe synchronously is an
//! [`OrchestrationError`].

use crate::core::{ExecutionStatus, PipelineStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// The main error type for orchestration operations.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// The run's declared dependencies are invalid.
    #[error("{0}")]
    Dependency(#[from] DependencyError),

    /// A graph computation could not produce an ordering.
    #[error("{0}")]
    Graph(#[from] GraphError),

    /// The configuration is invalid or could not be loaded.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// No run exists with the given id.
    #[error("Pipeline run not found: {0}")]
    RunNotFound(Uuid),

    /// The submission was rejected before a run was created.
    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    /// A run control action was requested in a state that does not allow it.
    #[error("Cannot {action} run {run_id} while it is {status}")]
    InvalidRunState {
        /// The run.
        run_id: Uuid,
        /// The run's current status.
        status: PipelineStatus,
        /// The rejected action.
        action: &'static str,
    },

    /// An execution status transition was rejected.
    #[error("Invalid transition for execution {execution_id}: {from} -> {to}")]
    InvalidTransition {
        /// The execution.
        execution_id: Uuid,
        /// Current status.
        from: ExecutionStatus,
        /// Requested status.
        to: ExecutionStatus,
    },

    /// No execution with the given kind exists in the run.
    #[error("Execution of kind '{kind}' not found in run {run_id}")]
    ExecutionNotFound {
        /// The run.
        run_id: Uuid,
        /// The requested kind.
        kind: String,
    },

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result alias used across the crate.
pub type Result<T, E = OrchestrationError> = std::result::Result<T, E>;

/// Diagnostic metadata attached to dependency errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Stable error code (e.g., "DEP-001-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info block.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// A dependency declaration problem found during run validation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DependencyError {
    /// Human-readable description.
    pub message: String,
    /// Cycles found in the dependency graph.
    pub cycles: Vec<Vec<String>>,
    /// Missing references as `(kind, missing dependency)` pairs.
    pub missing: Vec<(String, String)>,
    /// Diagnostic metadata.
    pub error_info: ErrorInfo,
}

impl DependencyError {
    /// Creates an error for one or more dependency cycles.
    #[must_use]
    pub fn cycles(cycles: Vec<Vec<String>>) -> Self {
        let rendered: Vec<String> = cycles.iter().map(|c| c.join(" -> ")).collect();
        let message = format!("Circular dependencies detected: {}", rendered.join("; "));
        let error_info = ErrorInfo::new("DEP-001-CYCLE", "Dependency cycle detected")
            .with_fix_hint("Remove one dependency from each listed cycle.")
            .with_context_entry("cycles", rendered.join("; "));
        Self {
            message,
            cycles,
            missing: Vec::new(),
            error_info,
        }
    }

    /// Creates an error for dependencies that reference undeclared kinds.
    #[must_use]
    pub fn missing(missing: Vec<(String, String)>) -> Self {
        let rendered: Vec<String> = missing
            .iter()
            .map(|(kind, dep)| format!("'{kind}' depends on '{dep}'"))
            .collect();
        let message = format!("Missing dependencies: {}", rendered.join(", "));
        let error_info =
            ErrorInfo::new("DEP-002-MISSING", "Dependency references an undeclared kind")
            .with_fix_hint("Declare the missing work units or drop the dependency.");
        Self {
            message,
            cycles: Vec::new(),
            missing,
            error_info,
        }
    }

    /// Merges the findings of another error into this one.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.message = format!("{}; {}", self.message, other.message);
        self.cycles.extend(other.cycles);
        self.missing.extend(other.missing);
        self
    }
}

/// Graph algorithms that need an acyclic graph report this instead of a
/// partial ordering.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// Nodes were left over after ordering, so the graph contains a cycle.
    #[error("Graph is unsortable; nodes left in a cycle: {}", remaining.join(", "))]
    Unsortable {
        /// Nodes that could not be ordered.
        remaining: Vec<String>,
    },
}

/// Configuration loading or validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML text could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field holds an unusable value.
    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Error returned by a work-unit handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The handler observed cancellation and stopped.
    #[error("Handler cancelled")]
    Cancelled,

    /// Any other error raised by handler code.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    /// Creates a failure with a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Describes why a single execution attempt did not succeed.
///
/// Faults are not surfaced to callers directly; they are analyzed by
/// failure recovery and end up in the execution's `last_error`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionFault {
    /// The handler raised or returned a failure.
    #[error("{0}")]
    Handler(String),

    /// The handler exceeded its allotted time.
    #[error("Execution timeout after {seconds:.1}s")]
    Timeout {
        /// The timeout that elapsed.
        seconds: f64,
    },

    /// No handler is registered for the execution's kind.
    #[error("No handler registered for kind '{0}'")]
    MissingHandler(String),

    /// The execution can never fit within the configured resource ceilings.
    #[error("Resource requirements exceed configured ceilings: {0}")]
    ResourceExhaustion(String),

    /// The handler task panicked.
    #[error("Handler task panicked: {0}")]
    Panicked(String),
}

impl ExecutionFault {
    /// Returns true if this fault is an execution timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
