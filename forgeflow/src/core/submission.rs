//! Run submission types.

use super::{ResourceRequirements, RetryStrategy, DEFAULT_PRIORITY};
use crate::config::RunConfigOverrides;
use crate::errors::{OrchestrationError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Declaration of one work unit in a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnitSpec {
    /// Work-unit kind, unique within the run.
    pub kind: String,
    /// Kinds this unit depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Scheduling priority (1-100).
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Resources claimed while running.
    #[serde(default)]
    pub resources: ResourceRequirements,
    /// Expected run time in seconds.
    #[serde(default)]
    pub estimated_duration_secs: Option<f64>,
    /// Overrides the run's default attempt limit.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Overrides the run's default retry strategy.
    #[serde(default)]
    pub retry_strategy: Option<RetryStrategy>,
    /// Handler configuration.
    #[serde(default)]
    pub configuration: HashMap<String, Value>,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl WorkUnitSpec {
    /// Creates a unit with no dependencies.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            depends_on: Vec::new(),
            priority: DEFAULT_PRIORITY,
            resources: ResourceRequirements::default(),
            estimated_duration_secs: None,
            max_attempts: None,
            retry_strategy: None,
            configuration: HashMap::new(),
        }
    }

    /// Adds a dependency.
    #[must_use]
    pub fn depends_on(mut self, kind: impl Into<String>) -> Self {
        self.depends_on.push(kind.into());
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the resource requirements.
    #[must_use]
    pub fn with_resources(mut self, resources: ResourceRequirements) -> Self {
        self.resources = resources;
        self
    }

    /// Sets the estimated duration.
    #[must_use]
    pub fn with_estimated_duration(mut self, secs: f64) -> Self {
        self.estimated_duration_secs = Some(secs);
        self
    }

    /// Sets the attempt limit.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Sets the retry strategy.
    #[must_use]
    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    /// Adds a handler configuration entry.
    #[must_use]
    pub fn with_config_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.configuration.insert(key.into(), value);
        self
    }
}

/// A request to create a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSubmission {
    /// Human-readable run name.
    pub name: String,
    /// Free-form brief passed to every handler.
    #[serde(default)]
    pub brief: String,
    /// Shared context passed to every handler.
    #[serde(default)]
    pub project_context: HashMap<String, Value>,
    /// Declared work units.
    pub units: Vec<WorkUnitSpec>,
    /// Per-run configuration overrides.
    #[serde(default)]
    pub overrides: RunConfigOverrides,
}

impl PipelineSubmission {
    /// Creates an empty submission.
    #[must_use]
    pub fn new(name: impl Into<String>, brief: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            brief: brief.into(),
            project_context: HashMap::new(),
            units: Vec::new(),
            overrides: RunConfigOverrides::default(),
        }
    }

    /// Creates a submission where each kind depends on the previous one.
    #[must_use]
    pub fn sequence<I, S>(name: impl Into<String>, brief: impl Into<String>, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut submission = Self::new(name, brief);
        let mut previous: Option<String> = None;
        for kind in kinds {
            let kind = kind.into();
            let mut unit = WorkUnitSpec::new(kind.clone());
            if let Some(prev) = previous.take() {
                unit = unit.depends_on(prev);
            }
            submission.units.push(unit);
            previous = Some(kind);
        }
        submission
    }

    /// Adds a work unit.
    #[must_use]
    pub fn unit(mut self, unit: WorkUnitSpec) -> Self {
        self.units.push(unit);
        self
    }

    /// Adds a project context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.project_context.insert(key.into(), value);
        self
    }

    /// Sets the per-run overrides.
    #[must_use]
    pub fn with_overrides(mut self, overrides: RunConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Checks structural problems that prevent creating a run.
    ///
    /// Dependency problems (cycles, missing kinds) are reported later by
    /// dependency validation, before any execution starts.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(OrchestrationError::InvalidSubmission(
                "run name must not be empty".into(),
            ));
        }
        if self.units.is_empty() {
            return Err(OrchestrationError::InvalidSubmission(
                "a run needs at least one work unit".into(),
            ));
        }
        let mut seen = HashSet::new();
        for unit in &self.units {
            if unit.kind.trim().is_empty() {
                return Err(OrchestrationError::InvalidSubmission(
                    "work unit kind must not be empty".into(),
                ));
            }
            if !seen.insert(unit.kind.as_str()) {
                return Err(OrchestrationError::InvalidSubmission(format!(
                    "duplicate work unit kind '{}'",
                    unit.kind
                )));
            }
            if !(1..=100).contains(&unit.priority) {
                return Err(OrchestrationError::InvalidSubmission(format!(
                    "priority {} of '{}' is outside 1..=100",
                    unit.priority, unit.kind
                )));
            }
        }
        Ok(())
    }
}
