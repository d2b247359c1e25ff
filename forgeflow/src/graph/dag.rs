//! Directed dependency graph over work-unit kinds.
//!
//! Edges point from a dependency to its dependents. Node sets are ordered
//! so that every traversal, ordering and level is deterministic.

use crate::errors::GraphError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::cmp::Reverse;

/// The longest weighted chain through the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalPath {
    /// Kinds along the path, first dependency first.
    pub path: Vec<String>,
    /// Sum of the durations of the kinds on the path.
    pub length: f64,
}

/// Dependency graph for one run.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// dependency -> dependents
    edges: BTreeMap<String, BTreeSet<String>>,
    /// dependent -> dependencies
    reverse_edges: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from `(kind, dependencies)` declarations.
    pub fn from_declarations<'a, I, D>(declarations: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, D)>,
        D: IntoIterator<Item = &'a str>,
    {
        let mut graph = Self::new();
        for (kind, deps) in declarations {
            graph.add_node(kind);
            for dep in deps {
                graph.add_edge(dep, kind);
            }
        }
        graph
    }

    /// Adds a node if absent.
    pub fn add_node(&mut self, node: &str) {
        self.edges.entry(node.to_string()).or_default();
        self.reverse_edges.entry(node.to_string()).or_default();
    }

    /// Adds an edge from `dependency` to `dependent`, creating both nodes.
    pub fn add_edge(&mut self, dependency: &str, dependent: &str) {
        self.add_node(dependency);
        self.add_node(dependent);
        if let Some(out) = self.edges.get_mut(dependency) {
            out.insert(dependent.to_string());
        }
        if let Some(inc) = self.reverse_edges.get_mut(dependent) {
            inc.insert(dependency.to_string());
        }
    }

    /// Removes a node and every edge touching it.
    ///
    /// Returns true if the node existed.
    pub fn remove_node(&mut self, node: &str) -> bool {
        let Some(dependents) = self.edges.remove(node) else {
            return false;
        };
        let dependencies = self.reverse_edges.remove(node).unwrap_or_default();
        for dependent in dependents {
            if let Some(inc) = self.reverse_edges.get_mut(&dependent) {
                inc.remove(node);
            }
        }
        for dependency in dependencies {
            if let Some(out) = self.edges.get_mut(&dependency) {
                out.remove(node);
            }
        }
        true
    }

    /// Returns true if the node exists.
    #[must_use]
    pub fn contains(&self, node: &str) -> bool {
        self.edges.contains_key(node)
    }

    /// All nodes in sorted order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(String::as_str)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Direct dependencies of `node`.
    #[must_use]
    pub fn predecessors(&self, node: &str) -> Vec<String> {
        self.reverse_edges
            .get(node)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Direct dependents of `node`.
    #[must_use]
    pub fn successors(&self, node: &str) -> Vec<String> {
        self.edges
            .get(node)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every transitive dependency of `node`.
    #[must_use]
    pub fn ancestors(&self, node: &str) -> BTreeSet<String> {
        Self::closure(&self.reverse_edges, node)
    }

    /// Every transitive dependent of `node`.
    #[must_use]
    pub fn descendants(&self, node: &str) -> BTreeSet<String> {
        Self::closure(&self.edges, node)
    }

    fn closure(adjacency: &BTreeMap<String, BTreeSet<String>>, start: &str) -> BTreeSet<String> {
        let mut visited = BTreeSet::new();
        let mut stack: Vec<&str> = adjacency
            .get(start)
            .map(|s| s.iter().map(String::as_str).collect())
            .unwrap_or_default();
        while let Some(node) = stack.pop() {
            if visited.insert(node.to_string()) {
                if let Some(next) = adjacency.get(node) {
                    stack.extend(next.iter().map(String::as_str));
                }
            }
        }
        visited.remove(start);
        visited
    }

    /// Cycles found by depth-first search with a recursion stack.
    ///
    /// Each cycle is reported as the path from the re-entered node back to
    /// itself, e.g. `[a, b, a]`.
    #[must_use]
    pub fn find_cycles(&self) -> Vec<Vec<String>> {
        let mut cycles = Vec::new();
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        for node in self.edges.keys() {
            if !visited.contains(node.as_str()) {
                let mut path = Vec::new();
                let mut on_stack = BTreeSet::new();
                self.dfs_cycles(node, &mut visited, &mut on_stack, &mut path, &mut cycles);
            }
        }
        cycles
    }

    fn dfs_cycles<'a>(
        &'a self,
        node: &'a str,
        visited: &mut BTreeSet<&'a str>,
        on_stack: &mut BTreeSet<&'a str>,
        path: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        visited.insert(node);
        on_stack.insert(node);
        path.push(node);

        if let Some(dependents) = self.edges.get(node) {
            for next in dependents {
                if on_stack.contains(next.as_str()) {
                    if let Some(start) = path.iter().position(|n| *n == next.as_str()) {
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|n| (*n).to_string()).collect();
                        cycle.push(next.clone());
                        cycles.push(cycle);
                    }
                } else if !visited.contains(next.as_str()) {
                    self.dfs_cycles(next, visited, on_stack, path, cycles);
                }
            }
        }

        path.pop();
        on_stack.remove(node);
    }

    /// Returns true if any cycle exists.
    #[must_use]
    pub fn has_cycles(&self) -> bool {
        !self.find_cycles().is_empty()
    }

    fn in_degrees(&self) -> HashMap<&str, usize> {
        self.reverse_edges
            .iter()
            .map(|(node, deps)| (node.as_str(), deps.len()))
            .collect()
    }

    fn unsortable(&self, ordered: &[String]) -> GraphError {
        let done: BTreeSet<&str> = ordered.iter().map(String::as_str).collect();
        GraphError::Unsortable {
            remaining: self
                .nodes()
                .filter(|n| !done.contains(n))
                .map(str::to_string)
                .collect(),
        }
    }

    /// Kahn's algorithm; ties are broken alphabetically.
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        self.ordered_by(|node| Reverse(node.to_string()))
    }

    /// Kahn's algorithm where, among ready nodes, the one with the highest
    /// `rank` is emitted first.
    pub(crate) fn ordered_by<K, F>(&self, rank: F) -> Result<Vec<String>, GraphError>
    where
        K: Ord,
        F: Fn(&str) -> K,
    {
        let mut in_degree = self.in_degrees();
        let mut ready: BinaryHeap<(K, Reverse<&str>)> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| (rank(n), Reverse(*n)))
            .collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some((_, Reverse(node))) = ready.pop() {
            order.push(node.to_string());
            if let Some(dependents) = self.edges.get(node) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push((rank(dependent), Reverse(dependent.as_str())));
                        }
                    }
                }
            }
        }

        if order.len() == self.len() {
            Ok(order)
        } else {
            Err(self.unsortable(&order))
        }
    }

    /// Partitions nodes into waves whose dependencies all lie in earlier waves.
    pub fn execution_levels(&self) -> Result<Vec<Vec<String>>, GraphError> {
        let mut remaining: BTreeMap<&str, BTreeSet<&str>> = self
            .reverse_edges
            .iter()
            .map(|(n, deps)| (n.as_str(), deps.iter().map(String::as_str).collect()))
            .collect();
        let mut levels = Vec::new();

        while !remaining.is_empty() {
            let level: Vec<&str> = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(n, _)| *n)
                .collect();
            if level.is_empty() {
                return Err(GraphError::Unsortable {
                    remaining: remaining.keys().map(|n| (*n).to_string()).collect(),
                });
            }
            for node in &level {
                remaining.remove(node);
            }
            for deps in remaining.values_mut() {
                for node in &level {
                    deps.remove(node);
                }
            }
            levels.push(level.into_iter().map(str::to_string).collect());
        }
        Ok(levels)
    }

    /// Longest path by summed node duration; missing durations count as 1.0.
    pub fn critical_path(
        &self,
        durations: &HashMap<String, f64>,
    ) -> Result<CriticalPath, GraphError> {
        let order = self.topological_order()?;
        let duration = |n: &str| durations.get(n).copied().unwrap_or(1.0);
        let mut dist: HashMap<&str, f64> = HashMap::new();
        let mut best_pred: HashMap<&str, &str> = HashMap::new();

        for node in &order {
            let mut best: Option<(&str, f64)> = None;
            for pred in self.reverse_edges.get(node.as_str()).into_iter().flatten() {
                let candidate = dist.get(pred.as_str()).copied().unwrap_or(0.0);
                if best.map_or(true, |(_, b)| candidate > b) {
                    best = Some((pred.as_str(), candidate));
                }
            }
            if let Some((pred, _)) = best {
                best_pred.insert(node.as_str(), pred);
            }
            dist.insert(node.as_str(), best.map_or(0.0, |(_, d)| d) + duration(node));
        }

        let mut end: Option<(&str, f64)> = None;
        for node in &order {
            let d = dist.get(node.as_str()).copied().unwrap_or(0.0);
            if end.map_or(true, |(_, best)| d > best) {
                end = Some((node.as_str(), d));
            }
        }
        let Some((end, length)) = end else {
            return Ok(CriticalPath {
                path: Vec::new(),
                length: 0.0,
            });
        };

        let mut path = vec![end.to_string()];
        let mut current = end;
        while let Some(&pred) = best_pred.get(current) {
            path.push(pred.to_string());
            current = pred;
        }
        path.reverse();
        Ok(CriticalPath { path, length })
    }

    /// Longest summed duration from each node to any sink, including itself.
    pub fn remaining_path_lengths(
        &self,
        durations: &HashMap<String, f64>,
    ) -> Result<HashMap<String, f64>, GraphError> {
        let order = self.topological_order()?;
        let mut lengths: HashMap<String, f64> = HashMap::new();
        for node in order.iter().rev() {
            let tail = self
                .successors(node)
                .iter()
                .filter_map(|s| lengths.get(s).copied())
                .fold(0.0, f64::max);
            let own = durations.get(node).copied().unwrap_or(1.0);
            lengths.insert(node.clone(), own + tail);
        }
        Ok(lengths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn diamond() -> DependencyGraph {
        // a -> b, a -> c, b -> d, c -> d
        DependencyGraph::from_declarations([
            ("a", vec![]),
            ("b", vec!["a"]),
            ("c", vec!["a"]),
            ("d", vec!["b", "c"]),
        ])
    }

    #[test]
    fn test_neighbours_and_closures() {
        let graph = diamond();
        assert_eq!(graph.predecessors("d"), vec!["b", "c"]);
        assert_eq!(graph.successors("a"), vec!["b", "c"]);
        assert_eq!(graph.ancestors("d").into_iter().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(graph.descendants("b").into_iter().collect::<Vec<_>>(), vec!["d"]);
        assert!(graph.ancestors("a").is_empty());
    }

    #[test]
    fn test_topological_order() {
        let graph = diamond();
        assert_eq!(graph.topological_order().unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_execution_levels() {
        let graph = diamond();
        assert_eq!(
            graph.execution_levels().unwrap(),
            vec![vec!["a".to_string()], vec!["b".into(), "c".into()], vec!["d".into()]]
        );
    }

    #[test]
    fn test_two_node_cycle() {
        let graph = DependencyGraph::from_declarations([("a", vec!["b"]), ("b", vec!["a"])]);
        assert_eq!(graph.find_cycles(), vec![vec!["a".to_string(), "b".into(), "a".into()]]);
        assert!(graph.has_cycles());
    }

    #[test]
    fn test_self_cycle() {
        let graph = DependencyGraph::from_declarations([("a", vec!["a"])]);
        assert_eq!(graph.find_cycles(), vec![vec!["a".to_string(), "a".into()]]);
    }

    #[test]
    fn test_cyclic_graph_is_unsortable() {
        let graph = DependencyGraph::from_declarations([
            ("root", vec![]),
            ("a", vec!["root", "b"]),
            ("b", vec!["a"]),
        ]);
        assert_eq!(
            graph.topological_order().unwrap_err(),
            GraphError::Unsortable {
                remaining: vec!["a".into(), "b".into()]
            }
        );
        assert!(matches!(
            graph.execution_levels(),
            Err(GraphError::Unsortable { .. })
        ));
        assert!(graph.critical_path(&HashMap::new()).is_err());
    }

    #[test]
    fn test_critical_path_weighted() {
        let graph = diamond();
        let durations = HashMap::from([
            ("a".to_string(), 2.0),
            ("b".to_string(), 1.0),
            ("c".to_string(), 5.0),
            ("d".to_string(), 1.0),
        ]);
        let critical = graph.critical_path(&durations).unwrap();
        assert_eq!(critical.path, vec!["a", "c", "d"]);
        assert!((critical.length - 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_critical_path_default_durations() {
        let graph = DependencyGraph::from_declarations([
            ("a", vec![]),
            ("b", vec!["a"]),
            ("c", vec!["b"]),
        ]);
        let critical = graph.critical_path(&HashMap::new()).unwrap();
        assert_eq!(critical.path, vec!["a", "b", "c"]);
        assert!((critical.length - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_remaining_path_lengths() {
        let lengths = diamond().remaining_path_lengths(&HashMap::new()).unwrap();
        assert!((lengths["a"] - 3.0).abs() < f64::EPSILON);
        assert!((lengths["d"] - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_remove_node() {
        let mut graph = diamond();
        assert!(graph.remove_node("b"));
        assert!(!graph.remove_node("b"));
        assert_eq!(graph.predecessors("d"), vec!["c"]);
        assert_eq!(graph.successors("a"), vec!["c"]);
        assert_eq!(graph.len(), 3);
    }
}
