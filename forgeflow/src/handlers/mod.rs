//! The work-unit handler contract.
//!
//! The engine never knows what a work unit computes. It looks up a
//! [`WorkUnitHandler`] for the unit's kind in a [`HandlerRegistry`], hands
//! it a [`HandlerInput`] assembled from the run and the outputs of the
//! unit's dependencies, and records the returned [`WorkOutput`].

mod registry;

pub use registry::{HandlerFactory, HandlerRegistry};

use crate::cancellation::CancellationToken;
use crate::core::WorkOutput;
use crate::errors::HandlerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Everything a handler receives for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerInput {
    /// Owning run.
    pub run_id: Uuid,
    /// The execution being attempted.
    pub execution_id: Uuid,
    /// The execution's kind.
    pub kind: String,
    /// Attempt number (1-based).
    pub attempt: u32,
    /// Run name.
    pub run_name: String,
    /// Run brief.
    pub brief: String,
    /// Shared project context.
    pub project_context: HashMap<String, Value>,
    /// Result of each dependency, keyed by kind.
    pub dependency_outputs: HashMap<String, Value>,
    /// Merged `context_updates` of every dependency.
    pub context: HashMap<String, Value>,
    /// The unit's configuration.
    pub configuration: HashMap<String, Value>,
}

impl HandlerInput {
    /// Output of the dependency `kind`, if it ran.
    #[must_use]
    pub fn dependency(&self, kind: &str) -> Option<&Value> {
        self.dependency_outputs.get(kind)
    }

    /// Configuration entry `key`.
    #[must_use]
    pub fn config(&self, key: &str) -> Option<&Value> {
        self.configuration.get(key)
    }
}

/// Executes one kind of work unit.
///
/// Implementations should check `cancel` at convenient points and may
/// return [`HandlerError::Cancelled`] when they stop early. A handler that
/// ignores cancellation is tolerated; its late result is discarded.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkUnitHandler: Send + Sync {
    /// Runs one attempt.
    async fn execute(
        &self,
        input: HandlerInput,
        cancel: Arc<CancellationToken>,
    ) -> Result<WorkOutput, HandlerError>;
}
