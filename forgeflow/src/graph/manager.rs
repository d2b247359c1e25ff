//! Dependency analysis for one run.

use super::{CriticalPath, DependencyGraph};
use crate::core::{PipelineRun, Severity, WorkUnitExecution, DEFAULT_ESTIMATED_DURATION_SECS};
use crate::errors::{DependencyError, GraphError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// How [`DependencyManager::execution_order`] orders kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderingStrategy {
    /// Kahn order, ties alphabetical.
    #[default]
    Topological,
    /// Kahn order, ties broken by longest remaining path first.
    CriticalPath,
    /// Execution levels flattened in order.
    Levels,
}

/// What an optimization suggestion is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    /// The graph contains a cycle.
    CircularDependency,
    /// A kind gates many dependents.
    Bottleneck,
    /// Few kinds can run side by side.
    LowParallelism,
    /// The critical path is long.
    LongCriticalPath,
    /// Restructure to run more kinds side by side.
    IncreaseParallelism,
    /// Restructure to shorten the critical path.
    ReduceCriticalPath,
}

/// A non-binding recommendation derived from graph analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationSuggestion {
    /// Topic.
    pub kind: SuggestionKind,
    /// How much it matters.
    pub severity: Severity,
    /// What was found.
    pub description: String,
    /// What to do about it.
    pub recommendation: String,
    /// Supporting data.
    pub details: Value,
}

/// A dependency that names an undeclared kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingDependency {
    /// The declaring kind.
    pub kind: String,
    /// The undeclared dependency.
    pub missing: String,
}

/// Outcome of [`DependencyManager::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyValidation {
    /// True when there are no errors.
    pub valid: bool,
    /// Blocking problems.
    pub errors: Vec<String>,
    /// Non-blocking observations.
    pub warnings: Vec<String>,
    /// Cycles found.
    pub cycles: Vec<Vec<String>>,
    /// References to undeclared kinds.
    pub missing_dependencies: Vec<MissingDependency>,
    /// Heuristic suggestions.
    pub optimizations: Vec<OptimizationSuggestion>,
}

impl DependencyValidation {
    /// Converts a failed validation into an error.
    #[must_use]
    pub fn to_error(&self) -> Option<DependencyError> {
        if self.valid {
            return None;
        }
        let missing: Vec<(String, String)> = self
            .missing_dependencies
            .iter()
            .map(|m| (m.kind.clone(), m.missing.clone()))
            .collect();
        match (self.cycles.is_empty(), missing.is_empty()) {
            (false, true) => Some(DependencyError::cycles(self.cycles.clone())),
            (true, false) => Some(DependencyError::missing(missing)),
            (false, false) => Some(
                DependencyError::cycles(self.cycles.clone())
                    .merge(DependencyError::missing(missing)),
            ),
            (true, true) => None,
        }
    }
}

/// How parallel the graph can run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelismAnalysis {
    /// `min(1, average level size / node count)`, 1.0 for a single node.
    pub potential: f64,
    /// The execution levels.
    pub levels: Vec<Vec<String>>,
    /// Size of the widest level.
    pub max_parallel: usize,
    /// Number of levels.
    pub total_levels: usize,
}

/// How much of the run depends on one kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyImpact {
    /// The kind analyzed.
    pub kind: String,
    /// Its direct dependencies.
    pub dependencies: Vec<String>,
    /// Kinds that depend on it directly.
    pub direct_dependents: Vec<String>,
    /// Kinds that depend on it transitively.
    pub transitive_dependents: Vec<String>,
    /// Transitive dependents as a fraction of all kinds.
    pub criticality: f64,
}

/// Full dependency report for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyAnalysis {
    /// Validation outcome.
    pub validation: DependencyValidation,
    /// Execution levels, empty when invalid.
    pub execution_plan: Vec<Vec<String>>,
    /// Critical path, when the graph is sortable.
    pub critical_path: Option<CriticalPath>,
    /// Parallelism, when the graph is sortable.
    pub parallelism: Option<ParallelismAnalysis>,
    /// Structural changes worth considering.
    pub restructuring: Vec<OptimizationSuggestion>,
}

#[derive(Debug, Clone)]
struct Declaration {
    depends_on: Vec<String>,
    priority: u8,
    estimated_duration_secs: f64,
}

/// Validates and analyzes the declared dependencies of one run.
#[derive(Debug, Clone, Default)]
pub struct DependencyManager {
    graph: DependencyGraph,
    declared: BTreeMap<String, Declaration>,
}

impl DependencyManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a manager from a run's executions.
    #[must_use]
    pub fn from_run(run: &PipelineRun) -> Self {
        let mut manager = Self::new();
        for exec in &run.executions {
            manager.declare_execution(exec);
        }
        manager
    }

    /// Declares one execution.
    pub fn declare_execution(&mut self, exec: &WorkUnitExecution) {
        self.declare(
            &exec.kind,
            exec.depends_on.iter().map(String::as_str),
            exec.priority,
            exec.estimated_duration_or_default(),
        );
    }

    /// Declares a kind, its dependencies, priority and estimated duration.
    pub fn declare<'a>(
        &mut self,
        kind: &str,
        depends_on: impl IntoIterator<Item = &'a str>,
        priority: u8,
        estimated_duration_secs: f64,
    ) {
        self.graph.add_node(kind);
        let depends_on: Vec<String> = depends_on.into_iter().map(str::to_string).collect();
        for dep in &depends_on {
            self.graph.add_edge(dep, kind);
        }
        self.declared.insert(
            kind.to_string(),
            Declaration {
                depends_on,
                priority,
                estimated_duration_secs,
            },
        );
    }

    /// The underlying graph.
    #[must_use]
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    fn durations(&self) -> HashMap<String, f64> {
        self.declared
            .iter()
            .map(|(k, d)| (k.clone(), d.estimated_duration_secs))
            .collect()
    }

    /// Checks cycles and missing references, and collects suggestions.
    #[must_use]
    pub fn validate(&self) -> DependencyValidation {
        let missing_dependencies: Vec<MissingDependency> = self
            .declared
            .iter()
            .flat_map(|(kind, decl)| {
                decl.depends_on
                    .iter()
                    .filter(|dep| !self.declared.contains_key(*dep))
                    .map(move |dep| MissingDependency {
                        kind: kind.clone(),
                        missing: dep.clone(),
                    })
            })
            .collect();
        let cycles = self.graph.find_cycles();

        let mut errors: Vec<String> = cycles
            .iter()
            .map(|c| format!("Circular dependency detected: {}", c.join(" -> ")))
            .collect();
        errors.extend(missing_dependencies.iter().map(|m| {
            format!("Missing dependency: '{}' depends on undeclared '{}'", m.kind, m.missing)
        }));

        let mut warnings = Vec::new();
        if self.declared.len() > 1 {
            for kind in self.declared.keys() {
                let isolated = self.graph.predecessors(kind).is_empty()
                    && self.graph.successors(kind).is_empty();
                if isolated {
                    warnings.push(format!("'{kind}' has no dependencies or dependents"));
                }
            }
        }

        DependencyValidation {
            valid: errors.is_empty(),
            errors,
            warnings,
            cycles,
            missing_dependencies,
            optimizations: self.suggest_optimizations(),
        }
    }

    /// Orders every kind according to `strategy`.
    pub fn execution_order(&self, strategy: OrderingStrategy) -> Result<Vec<String>, GraphError> {
        match strategy {
            OrderingStrategy::Topological => self.graph.topological_order(),
            OrderingStrategy::Levels => {
                Ok(self.graph.execution_levels()?.into_iter().flatten().collect())
            }
            OrderingStrategy::CriticalPath => {
                let remaining = self.graph.remaining_path_lengths(&self.durations())?;
                // Scaled to integer milliseconds so the rank is totally ordered.
                self.graph.ordered_by(|node| {
                    let length = remaining.get(node).copied().unwrap_or(0.0);
                    ((length * 1000.0).round() as i64, Reverse(node.to_string()))
                })
            }
        }
    }

    /// True if `kind` is declared and all of its dependencies are in `completed`.
    #[must_use]
    pub fn can_execute(&self, kind: &str, completed: &HashSet<String>) -> bool {
        self.declared
            .get(kind)
            .is_some_and(|d| d.depends_on.iter().all(|dep| completed.contains(dep)))
    }

    /// Kinds from `all` that are not completed and may start now, sorted.
    #[must_use]
    pub fn ready_kinds(&self, completed: &HashSet<String>, all: &[String]) -> Vec<String> {
        let mut ready: Vec<String> = all
            .iter()
            .filter(|k| !completed.contains(*k) && self.can_execute(k, completed))
            .cloned()
            .collect();
        ready.sort();
        ready
    }

    /// Levels and parallelism potential.
    pub fn parallelism(&self) -> Result<ParallelismAnalysis, GraphError> {
        let levels = self.graph.execution_levels()?;
        let nodes = self.graph.len();
        let potential = if nodes <= 1 {
            1.0
        } else {
            let average = nodes as f64 / levels.len() as f64;
            (average / nodes as f64).min(1.0)
        };
        Ok(ParallelismAnalysis {
            potential,
            max_parallel: levels.iter().map(Vec::len).max().unwrap_or(0),
            total_levels: levels.len(),
            levels,
        })
    }

    /// Critical path using declared estimated durations.
    pub fn critical_path(&self) -> Result<CriticalPath, GraphError> {
        self.graph.critical_path(&self.durations())
    }

    /// Heuristic suggestions: cycles, bottlenecks, low parallelism and long
    /// critical paths.
    #[must_use]
    pub fn suggest_optimizations(&self) -> Vec<OptimizationSuggestion> {
        let cycles = self.graph.find_cycles();
        if !cycles.is_empty() {
            return vec![OptimizationSuggestion {
                kind: SuggestionKind::CircularDependency,
                severity: Severity::Critical,
                description: format!("{} circular dependenc(ies) prevent execution", cycles.len()),
                recommendation: "Remove one dependency from each cycle".into(),
                details: json!({ "cycles": cycles }),
            }];
        }

        let mut suggestions = Vec::new();
        for kind in self.graph.nodes() {
            let dependents = self.graph.successors(kind);
            if dependents.len() > 3 {
                suggestions.push(OptimizationSuggestion {
                    kind: SuggestionKind::Bottleneck,
                    severity: Severity::Medium,
                    description: format!("'{kind}' gates {} dependents", dependents.len()),
                    recommendation: format!(
                        "Keep '{kind}' fast or split it so dependents can start earlier"
                    ),
                    details: json!({ "kind": kind, "dependents": dependents }),
                });
            }
        }

        if let Ok(parallelism) = self.parallelism() {
            if parallelism.potential < 0.3 {
                suggestions.push(OptimizationSuggestion {
                    kind: SuggestionKind::LowParallelism,
                    severity: Severity::Low,
                    description: format!(
                        "Parallelism potential is {:.2} across {} levels",
                        parallelism.potential, parallelism.total_levels
                    ),
                    recommendation: "Drop dependencies that are not strictly required".into(),
                    details: json!({
                        "potential": parallelism.potential,
                        "total_levels": parallelism.total_levels,
                        "max_parallel": parallelism.max_parallel,
                    }),
                });
            }
        }

        if let Ok(critical) = self.critical_path() {
            if critical.path.len() > 4 {
                suggestions.push(OptimizationSuggestion {
                    kind: SuggestionKind::LongCriticalPath,
                    severity: Severity::Medium,
                    description: format!("Critical path spans {} kinds", critical.path.len()),
                    recommendation: "Shorten the longest dependency chain".into(),
                    details: json!({ "path": critical.path, "length": critical.length }),
                });
            }
        }
        suggestions
    }

    /// Structural changes that would let the run finish sooner.
    #[must_use]
    pub fn restructuring_suggestions(&self) -> Vec<OptimizationSuggestion> {
        let mut suggestions = Vec::new();
        if let Ok(parallelism) = self.parallelism() {
            if parallelism.potential < 0.4 {
                let mut specifics = Vec::new();
                for kind in self.graph.nodes() {
                    let fan_out = self.graph.successors(kind).len();
                    if fan_out > 2 {
                        specifics.push(format!("Split '{kind}' which gates {fan_out} dependents"));
                    }
                    let ancestors = self.graph.ancestors(kind).len();
                    if ancestors > 3 {
                        specifics.push(format!("'{kind}' waits on {ancestors} upstream kinds"));
                    }
                }
                suggestions.push(OptimizationSuggestion {
                    kind: SuggestionKind::IncreaseParallelism,
                    severity: Severity::Medium,
                    description: format!("Parallelism potential is {:.2}", parallelism.potential),
                    recommendation: "Break long chains into independent branches".into(),
                    details: json!({ "specific_suggestions": specifics }),
                });
            }
        }
        if let Ok(critical) = self.critical_path() {
            if critical.path.len() > 4 {
                suggestions.push(OptimizationSuggestion {
                    kind: SuggestionKind::ReduceCriticalPath,
                    severity: Severity::Medium,
                    description: format!("Critical path has {} kinds", critical.path.len()),
                    recommendation: "Run independent parts of the critical path in parallel".into(),
                    details: json!({ "path": critical.path, "length": critical.length }),
                });
            }
        }
        suggestions
    }

    /// How much of the run depends on `kind`.
    #[must_use]
    pub fn impact(&self, kind: &str) -> DependencyImpact {
        let transitive: Vec<String> = self.graph.descendants(kind).into_iter().collect();
        let nodes = self.graph.len();
        DependencyImpact {
            kind: kind.to_string(),
            dependencies: self.graph.predecessors(kind),
            direct_dependents: self.graph.successors(kind),
            criticality: if nodes == 0 {
                0.0
            } else {
                transitive.len() as f64 / nodes as f64
            },
            transitive_dependents: transitive,
        }
    }

    /// Validation, plan, critical path, parallelism and restructuring in one report.
    #[must_use]
    pub fn analyze(&self) -> DependencyAnalysis {
        let validation = self.validate();
        if !validation.valid {
            return DependencyAnalysis {
                validation,
                execution_plan: Vec::new(),
                critical_path: None,
                parallelism: None,
                restructuring: Vec::new(),
            };
        }
        DependencyAnalysis {
            execution_plan: self.graph.execution_levels().unwrap_or_default(),
            critical_path: self.critical_path().ok(),
            parallelism: self.parallelism().ok(),
            restructuring: self.restructuring_suggestions(),
            validation,
        }
    }

    /// Reorders executions: fewer dependencies first, then higher priority,
    /// then longer estimated duration.
    pub fn optimize_execution_order(executions: &mut [WorkUnitExecution]) {
        executions.sort_by(|a, b| {
            a.depends_on
                .len()
                .cmp(&b.depends_on.len())
                .then_with(|| b.priority.cmp(&a.priority))
                .then_with(|| {
                    let da = a.estimated_duration_secs.unwrap_or(DEFAULT_ESTIMATED_DURATION_SECS);
                    let db = b.estimated_duration_secs.unwrap_or(DEFAULT_ESTIMATED_DURATION_SECS);
                    db.total_cmp(&da)
                })
        });
    }

    /// Priority of a declared kind.
    #[must_use]
    pub fn priority_of(&self, kind: &str) -> Option<u8> {
        self.declared.get(kind).map(|d| d.priority)
    }
}

/// Engine-wide dependency validation counters.
#[derive(Debug, Default)]
pub struct ValidationStats {
    validations: AtomicU64,
    failures: AtomicU64,
    cycles_detected: AtomicU64,
}

/// Snapshot of [`ValidationStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationStatsSnapshot {
    /// Validations performed.
    pub total_validations: u64,
    /// Validations that found errors.
    pub validation_errors: u64,
    /// Cycles found across all validations.
    pub circular_dependencies_detected: u64,
}

impl ValidationStats {
    /// Records one validation.
    pub fn record(&self, validation: &DependencyValidation) {
        self.validations.fetch_add(1, Ordering::Relaxed);
        if !validation.valid {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.cycles_detected
            .fetch_add(validation.cycles.len() as u64, Ordering::Relaxed);
    }

    /// Current counters.
    #[must_use]
    pub fn snapshot(&self) -> ValidationStatsSnapshot {
        ValidationStatsSnapshot {
            total_validations: self.validations.load(Ordering::Relaxed),
            validation_errors: self.failures.load(Ordering::Relaxed),
            circular_dependencies_detected: self.cycles_detected.load(Ordering::Relaxed),
        }
    }

    /// True while fewer than half of all validations failed.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        let snapshot = self.snapshot();
        snapshot.validation_errors * 2 <= snapshot.total_validations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestrationConfig;
    use crate::core::{PipelineSubmission, WorkUnitSpec};
    use pretty_assertions::assert_eq;

    fn manager(decls: &[(&str, &[&str])]) -> DependencyManager {
        let mut manager = DependencyManager::new();
        for (kind, deps) in decls {
            manager.declare(kind, deps.iter().copied(), 50, 60.0);
        }
        manager
    }

    #[test]
    fn test_valid_chain() {
        let m = manager(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        let validation = m.validate();
        assert!(validation.valid);
        assert!(validation.to_error().is_none());
        assert_eq!(m.execution_order(OrderingStrategy::Topological).unwrap(), vec!["a", "b", "c"]);
        assert_eq!(m.execution_order(OrderingStrategy::Levels).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_reported() {
        let m = manager(&[("A", &["B"]), ("B", &["A"])]);
        let validation = m.validate();
        assert!(!validation.valid);
        assert_eq!(validation.cycles, vec![vec!["A".to_string(), "B".into(), "A".into()]]);
        assert_eq!(validation.optimizations[0].kind, SuggestionKind::CircularDependency);
        let err = validation.to_error().unwrap();
        assert_eq!(err.error_info.code, "DEP-001-CYCLE");
        assert!(m.execution_order(OrderingStrategy::CriticalPath).is_err());
    }

    #[test]
    fn test_missing_dependency_reported() {
        let m = manager(&[("coder", &["architect"])]);
        let validation = m.validate();
        assert!(!validation.valid);
        assert_eq!(
            validation.missing_dependencies,
            vec![MissingDependency {
                kind: "coder".into(),
                missing: "architect".into()
            }]
        );
        assert_eq!(validation.to_error().unwrap().error_info.code, "DEP-002-MISSING");
    }

    #[test]
    fn test_can_execute_and_ready_kinds() {
        let m = manager(&[("a", &[]), ("b", &["a"]), ("c", &["a"])]);
        let none = HashSet::new();
        let done_a: HashSet<String> = HashSet::from(["a".to_string()]);
        let all = vec!["a".to_string(), "b".into(), "c".into()];
        assert!(m.can_execute("a", &none));
        assert!(!m.can_execute("b", &none));
        assert!(!m.can_execute("unknown", &none));
        assert_eq!(m.ready_kinds(&none, &all), vec!["a"]);
        assert_eq!(m.ready_kinds(&done_a, &all), vec!["b", "c"]);
    }

    #[test]
    fn test_critical_path_ordering_prefers_long_branch() {
        let mut m = DependencyManager::new();
        m.declare("root", [], 50, 1.0);
        m.declare("short", ["root"], 50, 1.0);
        m.declare("long", ["root"], 50, 10.0);
        m.declare("tail", ["long"], 50, 5.0);
        assert_eq!(
            m.execution_order(OrderingStrategy::CriticalPath).unwrap(),
            vec!["root", "long", "tail", "short"]
        );
        assert_eq!(m.critical_path().unwrap().path, vec!["root", "long", "tail"]);
    }

    #[test]
    fn test_parallelism_and_suggestions() {
        let m = manager(&[
            ("hub", &[]),
            ("a", &["hub"]),
            ("b", &["hub"]),
            ("c", &["hub"]),
            ("d", &["hub"]),
        ]);
        let parallelism = m.parallelism().unwrap();
        assert_eq!(parallelism.total_levels, 2);
        assert_eq!(parallelism.max_parallel, 4);
        assert!((parallelism.potential - 0.5).abs() < 1e-9);
        let suggestions = m.suggest_optimizations();
        assert!(suggestions.iter().any(|s| s.kind == SuggestionKind::Bottleneck));
        assert!(!suggestions.iter().any(|s| s.kind == SuggestionKind::LowParallelism));
    }

    #[test]
    fn test_long_chain_suggestions() {
        let m = manager(&[("a", &[]), ("b", &["a"]), ("c", &["b"]), ("d", &["c"]), ("e", &["d"])]);
        let kinds: Vec<SuggestionKind> = m.suggest_optimizations().iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![SuggestionKind::LowParallelism, SuggestionKind::LongCriticalPath]);
        let restructuring: Vec<SuggestionKind> =
            m.restructuring_suggestions().iter().map(|s| s.kind).collect();
        assert_eq!(
            restructuring,
            vec![SuggestionKind::IncreaseParallelism, SuggestionKind::ReduceCriticalPath]
        );
    }

    #[test]
    fn test_impact() {
        let m = manager(&[("a", &[]), ("b", &["a"]), ("c", &["b"]), ("d", &[])]);
        let impact = m.impact("a");
        assert_eq!(impact.direct_dependents, vec!["b"]);
        assert_eq!(impact.transitive_dependents, vec!["b", "c"]);
        assert!((impact.criticality - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_from_run_and_optimized_order() {
        let submission = PipelineSubmission::new("r", "")
            .unit(WorkUnitSpec::new("late").depends_on("early").with_priority(90))
            .unit(WorkUnitSpec::new("early").with_priority(10))
            .unit(WorkUnitSpec::new("urgent").with_priority(80));
        let mut run = PipelineRun::from_submission(&submission, &OrchestrationConfig::default());
        let manager = DependencyManager::from_run(&run);
        assert!(manager.validate().valid);
        assert_eq!(manager.priority_of("late"), Some(90));

        DependencyManager::optimize_execution_order(&mut run.executions);
        let kinds: Vec<&str> = run.executions.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["urgent", "early", "late"]);
    }

    #[test]
    fn test_validation_stats() {
        let stats = ValidationStats::default();
        stats.record(&manager(&[("a", &[])]).validate());
        stats.record(&manager(&[("a", &["b"]), ("b", &["a"])]).validate());
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_validations, 2);
        assert_eq!(snapshot.validation_errors, 1);
        assert_eq!(snapshot.circular_dependencies_detected, 1);
        assert!(stats.is_healthy());
    }
}
