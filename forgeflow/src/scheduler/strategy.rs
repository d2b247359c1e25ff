//! Strategies that order ready executions for allocation.

use crate::core::{PipelineRun, WorkUnitExecution};
use crate::graph::DependencyGraph;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

/// Which ordering strategy a scheduler uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Highest priority, then fewest dependencies, then oldest.
    #[default]
    Priority,
    /// Priority per unit of claimed resources.
    ResourceAware,
    /// Longest remaining dependent chain first.
    CriticalPath,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Priority => write!(f, "priority"),
            Self::ResourceAware => write!(f, "resource_aware"),
            Self::CriticalPath => write!(f, "critical_path"),
        }
    }
}

impl StrategyKind {
    /// Builds the strategy.
    #[must_use]
    pub fn build(self) -> Box<dyn SchedulingStrategy> {
        match self {
            Self::Priority => Box::new(PriorityStrategy),
            Self::ResourceAware => Box::new(ResourceAwareStrategy),
            Self::CriticalPath => Box::new(CriticalPathStrategy),
        }
    }
}

/// Orders ready executions; the scheduler allocates in the returned order.
pub trait SchedulingStrategy: Send + Sync + fmt::Debug {
    /// The strategy's kind.
    fn kind(&self) -> StrategyKind;

    /// Returns `ready` reordered, most urgent first.
    fn prioritize<'a>(
        &self,
        ready: Vec<&'a WorkUnitExecution>,
        run: &PipelineRun,
    ) -> Vec<&'a WorkUnitExecution>;
}

fn by_priority(a: &WorkUnitExecution, b: &WorkUnitExecution) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.depends_on.len().cmp(&b.depends_on.len()))
        .then_with(|| a.created_at.cmp(&b.created_at))
}

/// Sorts by priority descending, then dependency count, then creation time.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityStrategy;

impl SchedulingStrategy for PriorityStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Priority
    }

    fn prioritize<'a>(
        &self,
        mut ready: Vec<&'a WorkUnitExecution>,
        _run: &PipelineRun,
    ) -> Vec<&'a WorkUnitExecution> {
        ready.sort_by(|a, b| by_priority(a, b));
        ready
    }
}

/// Sorts by `priority / max(weighted_cost, 1)` descending.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceAwareStrategy;

impl ResourceAwareStrategy {
    /// Efficiency score of one execution.
    #[must_use]
    pub fn score(execution: &WorkUnitExecution) -> f64 {
        f64::from(execution.priority) / execution.resource_requirements.weighted_cost().max(1.0)
    }
}

impl SchedulingStrategy for ResourceAwareStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ResourceAware
    }

    fn prioritize<'a>(
        &self,
        mut ready: Vec<&'a WorkUnitExecution>,
        _run: &PipelineRun,
    ) -> Vec<&'a WorkUnitExecution> {
        ready.sort_by(|a, b| {
            Self::score(b)
                .total_cmp(&Self::score(a))
                .then_with(|| by_priority(a, b))
        });
        ready
    }
}

/// Sorts by the longest remaining chain of estimated durations.
#[derive(Debug, Clone, Copy, Default)]
pub struct CriticalPathStrategy;

impl CriticalPathStrategy {
    /// Remaining path length per kind for the run's executions.
    #[must_use]
    pub fn remaining_lengths(run: &PipelineRun) -> HashMap<String, f64> {
        let graph = DependencyGraph::from_declarations(
            run.executions
                .iter()
                .map(|e| (e.kind.as_str(), e.depends_on.iter().map(String::as_str))),
        );
        let durations: HashMap<String, f64> = run
            .executions
            .iter()
            .map(|e| (e.kind.clone(), e.estimated_duration_or_default()))
            .collect();
        // A cyclic graph never reaches scheduling; fall back to no weighting.
        graph.remaining_path_lengths(&durations).unwrap_or_default()
    }
}

impl SchedulingStrategy for CriticalPathStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::CriticalPath
    }

    fn prioritize<'a>(
        &self,
        mut ready: Vec<&'a WorkUnitExecution>,
        run: &PipelineRun,
    ) -> Vec<&'a WorkUnitExecution> {
        let lengths = Self::remaining_lengths(run);
        let length = |e: &WorkUnitExecution| lengths.get(&e.kind).copied().unwrap_or(0.0);
        ready.sort_by(|a, b| length(b).total_cmp(&length(a)).then_with(|| by_priority(a, b)));
        ready
    }
}
