//! Dependency graph over a subtask decomposition.
//!
//! Dependencies are never user-supplied: they are derived by scanning each
//! subtask's string parameters for `<output_of_task_N>` placeholders. The
//! graph is validated once (unknown indices, cycles) before any dispatch,
//! and its structure is immutable afterwards; only node state mutates, and
//! only through the orchestrator.

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use axon_types::SubtaskSpec;
use regex::Regex;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("circular dependency detected in subtask graph")]
    Cycle,
    #[error("subtask {index} references non-existent subtask {dependency}")]
    UnresolvedDependency { index: usize, dependency: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Dispatched,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TaskNode {
    pub index: usize,
    pub spec: SubtaskSpec,
    pub dependencies: BTreeSet<usize>,
    pub state: NodeState,
}

#[derive(Debug)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
    dependents: Vec<Vec<usize>>,
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<output_of_task_(\d+)>").expect("placeholder pattern"))
}

/// Placeholder indices referenced by one string value.
fn placeholders_in(value: &str) -> impl Iterator<Item = usize> + '_ {
    placeholder_regex()
        .captures_iter(value)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| m.as_str().parse().ok())
}

impl TaskGraph {
    /// Build and validate. Fails before any node could be dispatched.
    pub fn build(specs: &[SubtaskSpec]) -> Result<Self, GraphError> {
        let n = specs.len();
        let mut nodes = Vec::with_capacity(n);
        let mut dependents = vec![Vec::new(); n];

        for (index, spec) in specs.iter().enumerate() {
            let mut dependencies = BTreeSet::new();
            for value in spec.task_parameters.values() {
                let Some(text) = value.as_str() else { continue };
                for dependency in placeholders_in(text) {
                    if dependency >= n {
                        return Err(GraphError::UnresolvedDependency { index, dependency });
                    }
                    dependencies.insert(dependency);
                }
            }
            for &dependency in &dependencies {
                dependents[dependency].push(index);
            }
            nodes.push(TaskNode {
                index,
                spec: spec.clone(),
                dependencies,
                state: NodeState::Pending,
            });
        }

        // Kahn's algorithm purely for cycle detection; execution order is
        // decided by the live frontier.
        let mut in_degree: Vec<usize> = nodes.iter().map(|node| node.dependencies.len()).collect();
        let mut queue: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut visited = 0;
        while let Some(index) = queue.pop() {
            visited += 1;
            for &dependent in &dependents[index] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }
        if visited != n {
            return Err(GraphError::Cycle);
        }

        Ok(Self { nodes, dependents })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> Option<&TaskNode> {
        self.nodes.get(index)
    }

    /// Pending nodes whose dependencies are all completed, ascending.
    pub fn frontier(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .filter(|node| node.state == NodeState::Pending)
            .filter(|node| {
                node.dependencies
                    .iter()
                    .all(|&dep| self.nodes[dep].state == NodeState::Completed)
            })
            .map(|node| node.index)
            .collect()
    }

    pub fn mark_dispatched(&mut self, index: usize) {
        if let Some(node) = self.nodes.get_mut(index) {
            node.state = NodeState::Dispatched;
        }
    }

    /// Complete a node and return the dependents that just became ready,
    /// ascending.
    pub fn mark_completed(&mut self, index: usize) -> Vec<usize> {
        let Some(node) = self.nodes.get_mut(index) else {
            return Vec::new();
        };
        node.state = NodeState::Completed;

        let mut ready: Vec<usize> = self.dependents[index]
            .iter()
            .copied()
            .filter(|&dep| {
                self.nodes[dep].state == NodeState::Pending
                    && self.nodes[dep]
                        .dependencies
                        .iter()
                        .all(|&d| self.nodes[d].state == NodeState::Completed)
            })
            .collect();
        ready.sort_unstable();
        ready
    }

    pub fn mark_failed(&mut self, index: usize) {
        if let Some(node) = self.nodes.get_mut(index) {
            node.state = NodeState::Failed;
        }
    }

    pub fn state(&self, index: usize) -> Option<NodeState> {
        self.nodes.get(index).map(|node| node.state)
    }

    pub fn all_completed(&self) -> bool {
        self.nodes
            .iter()
            .all(|node| node.state == NodeState::Completed)
    }

    pub fn has_inflight(&self) -> bool {
        self.nodes
            .iter()
            .any(|node| node.state == NodeState::Dispatched)
    }
}

/// Substitute dependency placeholders with completed node results.
///
/// A parameter that is exactly one placeholder takes the referenced result
/// verbatim (any JSON shape); placeholders embedded in longer strings are
/// spliced in textually — bare text for string results, serialized JSON
/// otherwise.
pub fn substitute_parameters(
    params: &serde_json::Map<String, serde_json::Value>,
    results: &HashMap<usize, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    let re = placeholder_regex();
    let mut out = params.clone();

    for value in out.values_mut() {
        let Some(text) = value.as_str() else { continue };

        if let Some(caps) = re.captures(text) {
            let whole = caps.get(0).map(|m| m.as_str() == text).unwrap_or(false);
            if whole {
                if let Some(index) = caps.get(1).and_then(|m| m.as_str().parse().ok()) {
                    if let Some(result) = results.get(&index) {
                        *value = result.clone();
                        continue;
                    }
                }
            }
        }

        let replaced = re.replace_all(text, |caps: &regex::Captures<'_>| {
            let index: usize = caps[1].parse().unwrap_or(usize::MAX);
            match results.get(&index) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            }
        });
        if replaced != text {
            *value = serde_json::Value::String(replaced.into_owned());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(capability: &str, params: serde_json::Value) -> SubtaskSpec {
        SubtaskSpec {
            capability_needed: capability.to_string(),
            task_parameters: params.as_object().cloned().unwrap_or_default(),
            task_description: String::new(),
        }
    }

    #[test]
    fn test_independent_subtasks_all_in_frontier() {
        let graph = TaskGraph::build(&[
            spec("a_v1", json!({"x": 1})),
            spec("b_v1", json!({"y": 2})),
            spec("c_v1", json!({"z": 3})),
        ])
        .unwrap();
        assert_eq!(graph.frontier(), vec![0, 1, 2]);
    }

    #[test]
    fn test_dependency_derived_from_placeholder() {
        let graph = TaskGraph::build(&[
            spec("search_v1", json!({"query": "rust"})),
            spec("summarize_v1", json!({"text": "<output_of_task_0>"})),
        ])
        .unwrap();
        assert_eq!(graph.frontier(), vec![0]);
        assert!(graph.node(1).unwrap().dependencies.contains(&0));
    }

    #[test]
    fn test_unknown_index_rejected() {
        let err = TaskGraph::build(&[spec("a_v1", json!({"x": "<output_of_task_7>"}))]).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnresolvedDependency {
                index: 0,
                dependency: 7
            }
        );
    }

    #[test]
    fn test_cycle_rejected() {
        let err = TaskGraph::build(&[
            spec("a_v1", json!({"x": "<output_of_task_1>"})),
            spec("b_v1", json!({"y": "<output_of_task_0>"})),
        ])
        .unwrap_err();
        assert_eq!(err, GraphError::Cycle);
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let err = TaskGraph::build(&[spec("a_v1", json!({"x": "<output_of_task_0>"}))]).unwrap_err();
        assert_eq!(err, GraphError::Cycle);
    }

    #[test]
    fn test_forward_reference_without_cycle_is_valid() {
        let graph = TaskGraph::build(&[
            spec("a_v1", json!({"x": "<output_of_task_1>"})),
            spec("b_v1", json!({"y": 1})),
        ])
        .unwrap();
        assert_eq!(graph.frontier(), vec![1]);
    }

    #[test]
    fn test_completion_advances_frontier_diamond() {
        let mut graph = TaskGraph::build(&[
            spec("root_v1", json!({})),
            spec("left_v1", json!({"in": "<output_of_task_0>"})),
            spec("right_v1", json!({"in": "<output_of_task_0>"})),
            spec(
                "join_v1",
                json!({"l": "<output_of_task_1>", "r": "<output_of_task_2>"}),
            ),
        ])
        .unwrap();

        assert_eq!(graph.frontier(), vec![0]);
        graph.mark_dispatched(0);
        assert_eq!(graph.mark_completed(0), vec![1, 2]);

        graph.mark_dispatched(1);
        graph.mark_dispatched(2);
        assert_eq!(graph.mark_completed(1), Vec::<usize>::new());
        assert_eq!(graph.mark_completed(2), vec![3]);
        assert!(!graph.all_completed());

        graph.mark_dispatched(3);
        graph.mark_completed(3);
        assert!(graph.all_completed());
    }

    #[test]
    fn test_substitute_whole_placeholder_takes_raw_value() {
        let params = spec("x", json!({"data": "<output_of_task_0>"})).task_parameters;
        let mut results = HashMap::new();
        results.insert(0, json!({"rows": [1, 2, 3]}));

        let out = substitute_parameters(&params, &results);
        assert_eq!(out["data"], json!({"rows": [1, 2, 3]}));
    }

    #[test]
    fn test_substitute_embedded_placeholder_splices_text() {
        let params = spec("x", json!({"prompt": "summarize: <output_of_task_0>"})).task_parameters;
        let mut results = HashMap::new();
        results.insert(0, json!("the findings"));

        let out = substitute_parameters(&params, &results);
        assert_eq!(out["prompt"], json!("summarize: the findings"));
    }

    #[test]
    fn test_substitute_embedded_non_string_serializes() {
        let params = spec("x", json!({"prompt": "count was <output_of_task_0>"})).task_parameters;
        let mut results = HashMap::new();
        results.insert(0, json!(42));

        let out = substitute_parameters(&params, &results);
        assert_eq!(out["prompt"], json!("count was 42"));
    }
}
