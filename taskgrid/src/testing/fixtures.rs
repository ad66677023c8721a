//! Graph and dispatcher fixtures.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::DispatcherConfig;
use crate::core::{RunId, TaskOutput, TaskParams, VariableId};
use crate::dispatcher::Dispatcher;
use crate::events::{EventSink, NoOpEventSink};
use crate::graph::{Branch, ExecGraph, FunctionRef, ProcessDef, VariableDecl};
use crate::storage::{BlobStorage, DatabaseBlobStorage, FilesystemBlobStorage};
use crate::store::InMemoryTaskStore;

/// A chain `p1 -> p2 -> ... -> pn`.
///
/// `p1` has no inputs and outputs `out1`; `p{i}` reads `out{i-1}` and
/// outputs `out{i}`.
#[must_use]
pub fn linear_graph(n: usize) -> ExecGraph {
    let mut graph = ExecGraph::new();
    for i in 1..=n {
        let mut process = ProcessDef::new(format!("p{i}"), format!("fn.p{i}")).with_output(VariableDecl::local(format!("out{i}")));
        if i > 1 {
            process = process.with_input(VariableDecl::local(format!("out{}", i - 1)));
        }
        graph = graph.with_process(process);
        if i > 1 {
            graph = graph.with_edge(format!("p{}", i - 1), format!("p{i}"));
        }
    }
    graph
}

/// A root `fanout` with `n` parallel branches feeding a `join`.
///
/// Branch `i` carries the inline value `branch = b{i}` and outputs `part`;
/// `join` reads every `part` as an array and outputs `joined`.
#[must_use]
pub fn parallel_graph(n: usize) -> ExecGraph {
    let branches = (1..=n)
        .map(|i| Branch::new(format!("b{i}")).with_inline("branch", format!("b{i}")))
        .collect();
    ExecGraph::new()
        .with_process(
            ProcessDef::new("fanout", "fn.fanout")
                .parallel(branches)
                .with_output(VariableDecl::local("part")),
        )
        .with_process(
            ProcessDef::new("join", "fn.join")
                .with_input(VariableDecl::array("part"))
                .with_output(VariableDecl::local("joined")),
        )
        .with_edge("fanout", "join")
}

/// A cacheable process reading the global `input` and writing `result`.
#[must_use]
pub fn cached_process(code: &str, input: &str) -> ProcessDef {
    ProcessDef::new(code, "fn.cached")
        .with_input(VariableDecl::global(input))
        .with_output(VariableDecl::local("result"))
        .with_cache(false)
}

/// A single cacheable process `compute` over the global `seed`.
#[must_use]
pub fn cached_graph() -> ExecGraph {
    ExecGraph::new()
        .with_global("seed")
        .with_process(cached_process("compute", "seed"))
}

/// Parameters of a detached task with the given output names.
#[must_use]
pub fn sample_params(outputs: &[&str]) -> TaskParams {
    TaskParams {
        run_id: RunId::new(1),
        process_code: "sample".into(),
        sub_context_id: "1".into(),
        function: FunctionRef::new("fn.sample"),
        pre_functions: Vec::new(),
        post_functions: Vec::new(),
        inputs: Vec::new(),
        outputs: outputs
            .iter()
            .zip(1_u64..)
            .map(|(name, id)| TaskOutput {
                name: (*name).to_string(),
                variable_id: VariableId::new(id),
                nullable: false,
            })
            .collect(),
        inline: BTreeMap::new(),
        timeout_secs: None,
    }
}

/// A dispatcher over in-memory SQLite storage that discards events.
///
/// # Panics
///
/// Panics if the in-memory database cannot be opened.
#[must_use]
pub fn in_memory_dispatcher() -> Dispatcher {
    in_memory_dispatcher_with_events(Arc::new(NoOpEventSink))
}

/// A dispatcher over in-memory SQLite storage reporting to `events`.
///
/// # Panics
///
/// Panics if the in-memory database cannot be opened.
#[must_use]
#[allow(clippy::expect_used)]
pub fn in_memory_dispatcher_with_events(events: Arc<dyn EventSink>) -> Dispatcher {
    let storage: Arc<dyn BlobStorage> =
        Arc::new(DatabaseBlobStorage::in_memory().expect("in-memory sqlite database"));
    Dispatcher::new(DispatcherConfig::default(), Arc::new(InMemoryTaskStore::new()), storage, events)
}

/// A dispatcher whose variables live under `root` on disk.
#[must_use]
pub fn filesystem_dispatcher(root: &std::path::Path) -> Dispatcher {
    Dispatcher::new(
        DispatcherConfig::default(),
        Arc::new(InMemoryTaskStore::new()),
        Arc::new(FilesystemBlobStorage::new(root)),
        Arc::new(NoOpEventSink),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_fixtures_validate() {
        let linear = linear_graph(3).validate().unwrap();
        assert_eq!(linear.order(), ["p1", "p2", "p3"]);
        let parallel = parallel_graph(2).validate().unwrap();
        assert_eq!(parallel.order(), ["fanout", "join"]);
        assert!(cached_graph().validate().is_ok());
    }
}
