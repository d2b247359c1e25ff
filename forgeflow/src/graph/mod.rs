//! Dependency graph analysis.
//!
//! [`DependencyGraph`] holds the raw algorithms (cycles, orderings, levels,
//! critical path). [`DependencyManager`] wraps it for one run's declared
//! dependencies and produces validation results and suggestions.

mod dag;
mod manager;

pub use dag::{CriticalPath, DependencyGraph};
pub use manager::{
    DependencyAnalysis, DependencyImpact, DependencyManager, DependencyValidation,
    MissingDependency, OptimizationSuggestion, OrderingStrategy, ParallelismAnalysis,
    SuggestionKind, ValidationStats, ValidationStatsSnapshot,
};
