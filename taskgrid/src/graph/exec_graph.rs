//! The execution graph of one pipeline run and its validation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use super::condition::Condition;
use super::process::{ProcessDef, VariableContext};
use super::schema::CURRENT_GRAPH_VERSION;
use crate::core::RunId;
use crate::errors::GraphError;

/// A directed edge: `from` produces input for `to`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Producing process code.
    pub from: String,
    /// Consuming process code.
    pub to: String,
}

const fn current_version() -> u32 {
    CURRENT_GRAPH_VERSION
}

/// The DAG for one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecGraph {
    /// Schema version of the serialized form.
    #[serde(default = "current_version")]
    pub version: u32,
    /// Process definitions in declaration order.
    pub processes: Vec<ProcessDef>,
    /// Adjacency list.
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Names of run-level global variables.
    #[serde(default)]
    pub globals: Vec<String>,
    /// Run-level inline values.
    #[serde(default)]
    pub inline: BTreeMap<String, String>,
    /// Top-level run of a nested sub-run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_run_id: Option<RunId>,
    /// Direct parent of a nested sub-run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<RunId>,
}

impl Default for ExecGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: CURRENT_GRAPH_VERSION,
            processes: Vec::new(),
            edges: Vec::new(),
            globals: Vec::new(),
            inline: BTreeMap::new(),
            root_run_id: None,
            parent_run_id: None,
        }
    }

    /// Adds a process.
    #[must_use]
    pub fn with_process(mut self, process: ProcessDef) -> Self {
        self.processes.push(process);
        self
    }

    /// Adds an edge.
    #[must_use]
    pub fn with_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// Declares a global variable.
    #[must_use]
    pub fn with_global(mut self, name: impl Into<String>) -> Self {
        self.globals.push(name.into());
        self
    }

    /// Adds a run-level inline value.
    #[must_use]
    pub fn with_inline(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inline.insert(key.into(), value.into());
        self
    }

    /// Marks the graph as a nested sub-run.
    #[must_use]
    pub fn with_parent(mut self, root: RunId, parent: RunId) -> Self {
        self.root_run_id = Some(root);
        self.parent_run_id = Some(parent);
        self
    }

    /// Looks up a process by code.
    #[must_use]
    pub fn process(&self, code: &str) -> Option<&ProcessDef> {
        self.processes.iter().find(|p| p.code == code)
    }

    /// Validates the graph and computes its layout.
    pub fn validate(self) -> Result<ValidatedGraph, GraphError> {
        let mut seen = HashSet::new();
        for process in &self.processes {
            if !seen.insert(process.code.as_str()) {
                return Err(GraphError::DuplicateProcess(process.code.clone()));
            }
        }

        let mut predecessors: HashMap<String, Vec<String>> = self
            .processes
            .iter()
            .map(|p| (p.code.clone(), Vec::new()))
            .collect();
        let mut successors = predecessors.clone();
        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !predecessors.contains_key(end) {
                    return Err(GraphError::UnknownProcess(end.clone()));
                }
            }
            if let Some(preds) = predecessors.get_mut(&edge.to) {
                if !preds.contains(&edge.from) {
                    preds.push(edge.from.clone());
                }
            }
            if let Some(succs) = successors.get_mut(&edge.from) {
                if !succs.contains(&edge.to) {
                    succs.push(edge.to.clone());
                }
            }
        }

        let insertion: Vec<String> = self.processes.iter().map(|p| p.code.clone()).collect();
        if let Some(path) = find_cycle(&insertion, &successors) {
            return Err(GraphError::Cycle { path });
        }

        for process in &self.processes {
            let has_preds = predecessors.get(&process.code).is_some_and(|p| !p.is_empty());
            if process.inputs.is_empty() && has_preds {
                return Err(GraphError::InvalidRoot(process.code.clone()));
            }
        }

        let order = topological_sort(&insertion, &predecessors);
        let position: HashMap<String, usize> =
            order.iter().enumerate().map(|(i, code)| (code.clone(), i)).collect();

        let mut ancestors: HashMap<String, Vec<String>> = HashMap::new();
        for code in &order {
            ancestors.insert(code.clone(), nearest_ancestors(code, &predecessors, &position));
        }

        let mut bindings = HashMap::new();
        for process in &self.processes {
            for input in &process.inputs {
                let binding = self.bind_input(process, &input.name, input.context, &ancestors)?;
                bindings.insert((process.code.clone(), input.name.clone()), binding);
            }
            if let Some(ref condition) = process.condition {
                Condition::parse(condition)?;
            }
        }

        Ok(ValidatedGraph {
            graph: self,
            order,
            position,
            predecessors,
            bindings,
        })
    }

    fn bind_input(
        &self,
        process: &ProcessDef,
        name: &str,
        context: VariableContext,
        ancestors: &HashMap<String, Vec<String>>,
    ) -> Result<InputBinding, GraphError> {
        let in_branches = process.sub_processes.as_ref().is_some_and(|s| {
            !s.branches.is_empty() && s.branches.iter().all(|b| b.inline.contains_key(name))
        });
        if process.inline.contains_key(name) || self.inline.contains_key(name) || in_branches {
            return Ok(InputBinding::Inline);
        }

        let declared_global = self.globals.iter().any(|g| g == name);
        if context == VariableContext::Global || declared_global {
            return if declared_global {
                Ok(InputBinding::Global)
            } else {
                Err(GraphError::UnresolvableInput {
                    process: process.code.clone(),
                    input: name.to_string(),
                })
            };
        }

        ancestors
            .get(&process.code)
            .into_iter()
            .flatten()
            .find(|code| self.process(code).is_some_and(|p| p.output(name).is_some()))
            .map(|code| InputBinding::Upstream(code.clone()))
            .ok_or_else(|| GraphError::UnresolvableInput {
                process: process.code.clone(),
                input: name.to_string(),
            })
    }
}

/// How a declared input is satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputBinding {
    /// An inline literal of the branch, the process or the run.
    Inline,
    /// A run-level global variable.
    Global,
    /// The output of this upstream process.
    Upstream(String),
}

/// A graph that passed validation, with its topological layout.
#[derive(Debug, Clone)]
pub struct ValidatedGraph {
    graph: ExecGraph,
    order: Vec<String>,
    position: HashMap<String, usize>,
    predecessors: HashMap<String, Vec<String>>,
    bindings: HashMap<(String, String), InputBinding>,
}

impl ValidatedGraph {
    /// The underlying graph.
    #[must_use]
    pub fn graph(&self) -> &ExecGraph {
        &self.graph
    }

    /// Process codes in topological order.
    #[must_use]
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Position of a process in topological order.
    #[must_use]
    pub fn topo_index(&self, code: &str) -> Option<usize> {
        self.position.get(code).copied()
    }

    /// Direct predecessors of a process.
    #[must_use]
    pub fn predecessors(&self, code: &str) -> &[String] {
        self.predecessors.get(code).map_or(&[], Vec::as_slice)
    }

    /// Processes in topological order.
    pub fn processes_in_order(&self) -> impl Iterator<Item = &ProcessDef> {
        self.order.iter().filter_map(|code| self.graph.process(code))
    }

    /// The binding chosen for an input during validation.
    #[must_use]
    pub fn binding(&self, process: &str, input: &str) -> Option<&InputBinding> {
        self.bindings.get(&(process.to_string(), input.to_string()))
    }

    /// Checks that every non-nullable input bound to a global is covered
    /// by `supplied`. Reports the first gap in topological order.
    pub fn check_globals(&self, supplied: impl Fn(&str) -> bool) -> Result<(), GraphError> {
        for process in self.processes_in_order() {
            for input in process.inputs.iter().filter(|i| !i.nullable) {
                if self.binding(&process.code, &input.name) == Some(&InputBinding::Global) && !supplied(&input.name) {
                    return Err(GraphError::MissingGlobal {
                        process: process.code.clone(),
                        input: input.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Depth-first cycle search over successors, in insertion order.
fn find_cycle(insertion: &[String], successors: &HashMap<String, Vec<String>>) -> Option<Vec<String>> {
    fn dfs(
        node: &str,
        successors: &HashMap<String, Vec<String>>,
        visited: &mut HashSet<String>,
        on_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(node.to_string());
        on_stack.insert(node.to_string());
        path.push(node.to_string());

        for next in successors.get(node).into_iter().flatten() {
            if !visited.contains(next) {
                if let Some(cycle) = dfs(next, successors, visited, on_stack, path) {
                    return Some(cycle);
                }
            } else if on_stack.contains(next) {
                let start = path.iter().position(|n| n == next).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(next.clone());
                return Some(cycle);
            }
        }

        path.pop();
        on_stack.remove(node);
        None
    }

    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    let mut path = Vec::new();
    for code in insertion {
        if !visited.contains(code) {
            if let Some(cycle) = dfs(code, successors, &mut visited, &mut on_stack, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Predecessors-first DFS, visiting roots in insertion order for determinism.
fn topological_sort(insertion: &[String], predecessors: &HashMap<String, Vec<String>>) -> Vec<String> {
    fn visit(
        node: &str,
        predecessors: &HashMap<String, Vec<String>>,
        visited: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) {
        if !visited.insert(node.to_string()) {
            return;
        }
        for dep in predecessors.get(node).into_iter().flatten() {
            visit(dep, predecessors, visited, result);
        }
        result.push(node.to_string());
    }

    let mut result = Vec::with_capacity(insertion.len());
    let mut visited = HashSet::new();
    for code in insertion {
        visit(code, predecessors, &mut visited, &mut result);
    }
    result
}

/// All transitive predecessors, nearest (latest in topological order) first.
fn nearest_ancestors(
    code: &str,
    predecessors: &HashMap<String, Vec<String>>,
    position: &HashMap<String, usize>,
) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut stack: Vec<&String> = predecessors.get(code).into_iter().flatten().collect();
    while let Some(node) = stack.pop() {
        if seen.insert(node.clone()) {
            stack.extend(predecessors.get(node).into_iter().flatten());
        }
    }
    let mut result: Vec<String> = seen.into_iter().collect();
    result.sort_by_key(|c| std::cmp::Reverse(position.get(c).copied().unwrap_or(0)));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Branch, ProcessDef, VariableDecl};
    use pretty_assertions::assert_eq;

    fn chain() -> ExecGraph {
        ExecGraph::new()
            .with_process(ProcessDef::new("p1", "fn.a").with_output(VariableDecl::local("x")))
            .with_process(
                ProcessDef::new("p2", "fn.b")
                    .with_input(VariableDecl::local("x"))
                    .with_output(VariableDecl::local("y")),
            )
            .with_process(ProcessDef::new("p3", "fn.c").with_input(VariableDecl::local("y")))
            .with_edge("p1", "p2")
            .with_edge("p2", "p3")
    }

    #[test]
    fn test_topological_order_and_bindings() {
        let graph = chain().validate().unwrap();
        assert_eq!(graph.order(), &["p1", "p2", "p3"]);
        assert_eq!(graph.topo_index("p3"), Some(2));
        assert_eq!(graph.predecessors("p2"), &["p1".to_string()]);
        assert_eq!(graph.binding("p3", "y"), Some(&InputBinding::Upstream("p2".into())));
    }

    #[test]
    fn test_order_respects_edges_not_declaration() {
        let graph = ExecGraph::new()
            .with_process(ProcessDef::new("late", "fn").with_input(VariableDecl::local("v")))
            .with_process(ProcessDef::new("early", "fn").with_output(VariableDecl::local("v")))
            .with_edge("early", "late")
            .validate()
            .unwrap();
        assert_eq!(graph.order(), &["early", "late"]);
    }

    #[test]
    fn test_cycle_is_reported_with_path() {
        let err = chain().with_edge("p3", "p1").validate().unwrap_err();
        match err {
            GraphError::Cycle { path } => {
                assert_eq!(path.first(), path.last());
                assert!(path.len() >= 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_edge_endpoint() {
        let err = chain().with_edge("p3", "ghost").validate().unwrap_err();
        assert_eq!(err, GraphError::UnknownProcess("ghost".into()));
    }

    #[test]
    fn test_duplicate_codes() {
        let err = chain().with_process(ProcessDef::new("p2", "fn")).validate().unwrap_err();
        assert_eq!(err, GraphError::DuplicateProcess("p2".into()));
    }

    #[test]
    fn test_process_without_inputs_must_be_root() {
        let err = chain()
            .with_process(ProcessDef::new("p4", "fn"))
            .with_edge("p3", "p4")
            .validate()
            .unwrap_err();
        assert_eq!(err, GraphError::InvalidRoot("p4".into()));
    }

    #[test]
    fn test_unresolvable_input() {
        let err = ExecGraph::new()
            .with_process(ProcessDef::new("p1", "fn").with_input(VariableDecl::local("nowhere")))
            .validate()
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::UnresolvableInput {
                process: "p1".into(),
                input: "nowhere".into()
            }
        );
    }

    #[test]
    fn test_global_and_inline_bindings() {
        let graph = ExecGraph::new()
            .with_global("dataset")
            .with_inline("threshold", "0.5")
            .with_process(
                ProcessDef::new("p1", "fn")
                    .with_input(VariableDecl::global("dataset"))
                    .with_input(VariableDecl::local("threshold"))
                    .with_input(VariableDecl::local("part"))
                    .parallel(vec![
                        Branch::new("a").with_inline("part", "a"),
                        Branch::new("b").with_inline("part", "b"),
                    ]),
            )
            .validate()
            .unwrap();
        assert_eq!(graph.binding("p1", "dataset"), Some(&InputBinding::Global));
        assert_eq!(graph.binding("p1", "threshold"), Some(&InputBinding::Inline));
        assert_eq!(graph.binding("p1", "part"), Some(&InputBinding::Inline));
    }

    #[test]
    fn test_check_globals_reports_first_missing_required_global() {
        let graph = ExecGraph::new()
            .with_global("dataset")
            .with_global("hint")
            .with_process(
                ProcessDef::new("p1", "fn")
                    .with_input(VariableDecl::global("dataset"))
                    .with_input(VariableDecl::global("hint").nullable()),
            )
            .validate()
            .unwrap();

        assert_eq!(
            graph.check_globals(|_| false),
            Err(GraphError::MissingGlobal {
                process: "p1".into(),
                input: "dataset".into()
            })
        );
        assert_eq!(graph.check_globals(|name| name == "dataset"), Ok(()));
    }

    #[test]
    fn test_undeclared_global_is_rejected() {
        let err = ExecGraph::new()
            .with_process(ProcessDef::new("p1", "fn").with_input(VariableDecl::global("missing")))
            .validate()
            .unwrap_err();
        assert!(matches!(err, GraphError::UnresolvableInput { .. }));
    }

    #[test]
    fn test_bad_condition_is_a_schema_error() {
        let err = chain()
            .with_process(ProcessDef::new("p4", "fn").with_condition("a && b"))
            .validate()
            .unwrap_err();
        assert!(matches!(err, GraphError::Schema(_)));
    }

    #[test]
    fn test_nearest_ancestor_wins() {
        let graph = ExecGraph::new()
            .with_process(ProcessDef::new("a", "fn").with_output(VariableDecl::local("v")))
            .with_process(
                ProcessDef::new("b", "fn")
                    .with_input(VariableDecl::local("v"))
                    .with_output(VariableDecl::local("v")),
            )
            .with_process(ProcessDef::new("c", "fn").with_input(VariableDecl::local("v")))
            .with_edge("a", "b")
            .with_edge("b", "c")
            .validate()
            .unwrap();
        assert_eq!(graph.binding("c", "v"), Some(&InputBinding::Upstream("b".into())));
        assert_eq!(graph.binding("b", "v"), Some(&InputBinding::Upstream("a".into())));
    }
}
