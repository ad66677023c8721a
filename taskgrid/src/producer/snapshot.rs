//! Per-run view of the task store used by a production pass.

use std::collections::HashMap;

use crate::core::{RunState, Task, TaskExecState};
use crate::graph::{ProcessDef, ValidatedGraph};

/// Latest task of every (process, sub-context) pair of one run.
#[derive(Debug, Default)]
pub(crate) struct NodeSnapshot {
    latest: HashMap<(String, String), Task>,
}

/// Aggregated state of a process across its branch contexts.
#[derive(Debug)]
pub(crate) enum UpstreamStatus {
    /// Some context has not been produced or is still running.
    Pending,
    /// A mandatory context ended in `ERROR`; consumers are blocked for good.
    Failed,
    /// Every context is done. Holds the `OK` tasks in branch order.
    Finished(Vec<Task>),
}

/// How a context of a process ended, seen from its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Open,
    Passed,
    Failed,
}

fn settled(process: &ProcessDef, task: Option<&Task>) -> Settled {
    match task.map(|t| t.exec_state) {
        None => Settled::Open,
        Some(TaskExecState::Ok | TaskExecState::Skipped) => Settled::Passed,
        Some(TaskExecState::Error) if process.optional => Settled::Passed,
        Some(TaskExecState::Error) => Settled::Failed,
        Some(_) => Settled::Open,
    }
}

impl NodeSnapshot {
    /// Builds the snapshot; a retried context keeps only its newest task.
    pub(crate) fn from_tasks(tasks: Vec<Task>) -> Self {
        let mut snapshot = Self::default();
        for task in tasks {
            snapshot.record(task);
        }
        snapshot
    }

    pub(crate) fn record(&mut self, task: Task) {
        let key = (task.process_code().to_string(), task.sub_context_id().to_string());
        match self.latest.get(&key) {
            Some(existing) if existing.id > task.id => {}
            _ => {
                self.latest.insert(key, task);
            }
        }
    }

    pub(crate) fn latest(&self, process: &str, sub_context_id: &str) -> Option<&Task> {
        self.latest.get(&(process.to_string(), sub_context_id.to_string()))
    }

    pub(crate) fn has_open_tasks(&self) -> bool {
        self.latest.values().any(|t| !t.exec_state.is_terminal())
    }

    /// Sub-contexts of `process` that may receive a task now.
    ///
    /// Parallel (and branchless) processes open every unproduced context at
    /// once; sequential ones open the next context only after every earlier
    /// one passed.
    pub(crate) fn ready_contexts(&self, process: &ProcessDef) -> Vec<String> {
        let contexts = process.branch_contexts();
        if process.logic() == Some(crate::graph::SubProcessLogic::Sequential) {
            for context in contexts {
                let task = self.latest(&process.code, &context.sub_context_id);
                if task.is_none() {
                    return vec![context.sub_context_id];
                }
                if settled(process, task) != Settled::Passed {
                    break;
                }
            }
            return Vec::new();
        }
        contexts
            .into_iter()
            .filter(|c| self.latest(&process.code, &c.sub_context_id).is_none())
            .map(|c| c.sub_context_id)
            .collect()
    }

    pub(crate) fn upstream_status(&self, process: &ProcessDef) -> UpstreamStatus {
        let mut finished = Vec::new();
        let mut pending = false;
        for context in process.branch_contexts() {
            let task = self.latest(&process.code, &context.sub_context_id);
            match settled(process, task) {
                Settled::Failed => return UpstreamStatus::Failed,
                Settled::Open => pending = true,
                Settled::Passed => {
                    if let Some(task) = task.filter(|t| t.exec_state == TaskExecState::Ok) {
                        finished.push(task.clone());
                    }
                }
            }
        }
        if pending {
            UpstreamStatus::Pending
        } else {
            UpstreamStatus::Finished(finished)
        }
    }

    /// Derives the run state once no production progress is possible.
    pub(crate) fn outcome(&self, graph: &ValidatedGraph) -> (RunState, Option<String>) {
        if self.has_open_tasks() {
            return (RunState::Started, None);
        }

        let mut first_error: Option<(u64, String)> = None;
        let mut blocked: Option<String> = None;
        for process in graph.processes_in_order() {
            for context in process.branch_contexts() {
                let task = self.latest(&process.code, &context.sub_context_id);
                match (settled(process, task), task) {
                    (Settled::Passed, _) => {}
                    (Settled::Failed, Some(task)) => {
                        let message = task
                            .result
                            .as_ref()
                            .map(|r| r.console.clone())
                            .filter(|c| !c.is_empty())
                            .unwrap_or_else(|| format!("process '{}' failed", process.code));
                        if first_error.as_ref().map_or(true, |(id, _)| task.id.get() < *id) {
                            first_error = Some((task.id.get(), message));
                        }
                    }
                    _ => {
                        blocked.get_or_insert_with(|| {
                            format!("process '{}' context {} was never produced", process.code, context.sub_context_id)
                        });
                    }
                }
            }
        }

        match first_error.map(|(_, m)| m).or(blocked) {
            None => (RunState::Completed, None),
            Some(message) => (RunState::CompletedWithErrors, Some(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NewTask, RunId, TaskId, TaskParams, TaskResult};
    use crate::graph::{Branch, ExecGraph, FunctionRef};
    use crate::utils::now_utc;
    use std::collections::BTreeMap;

    fn task(id: u64, code: &str, ctx: &str, state: TaskExecState) -> Task {
        let mut task = Task::from_new(
            TaskId::new(id),
            NewTask {
                params: TaskParams {
                    run_id: RunId::new(1),
                    process_code: code.into(),
                    sub_context_id: ctx.into(),
                    function: FunctionRef::new("fn"),
                    pre_functions: Vec::new(),
                    post_functions: Vec::new(),
                    inputs: Vec::new(),
                    outputs: Vec::new(),
                    inline: BTreeMap::new(),
                    timeout_secs: None,
                },
                state: TaskExecState::None,
                priority: 0,
                topo_index: 0,
                tag: None,
                cache_fingerprint: None,
            },
            now_utc(),
        );
        task.exec_state = state;
        task
    }

    fn sequential() -> ProcessDef {
        ProcessDef::new("seq", "fn.seq").sequential(vec![Branch::new("a"), Branch::new("b"), Branch::new("c")])
    }

    #[test]
    fn test_latest_task_wins() {
        let snapshot = NodeSnapshot::from_tasks(vec![
            task(5, "p", "1", TaskExecState::Assignable),
            task(2, "p", "1", TaskExecState::Error),
        ]);
        assert_eq!(snapshot.latest("p", "1").unwrap().id, TaskId::new(5));
    }

    #[test]
    fn test_sequential_opens_one_context_at_a_time() {
        let p = sequential();
        let empty = NodeSnapshot::default();
        assert_eq!(empty.ready_contexts(&p), vec!["1,1".to_string()]);

        let running = NodeSnapshot::from_tasks(vec![task(1, "seq", "1,1", TaskExecState::Assigned)]);
        assert!(running.ready_contexts(&p).is_empty());

        let done = NodeSnapshot::from_tasks(vec![task(1, "seq", "1,1", TaskExecState::Ok)]);
        assert_eq!(done.ready_contexts(&p), vec!["1,2".to_string()]);

        let failed = NodeSnapshot::from_tasks(vec![task(1, "seq", "1,1", TaskExecState::Error)]);
        assert!(failed.ready_contexts(&p).is_empty());
    }

    #[test]
    fn test_parallel_opens_every_context() {
        let p = ProcessDef::new("par", "fn").parallel(vec![Branch::new("a"), Branch::new("b")]);
        let snapshot = NodeSnapshot::from_tasks(vec![task(1, "par", "1,2", TaskExecState::Assignable)]);
        assert_eq!(snapshot.ready_contexts(&p), vec!["1,1".to_string()]);
    }

    #[test]
    fn test_upstream_status() {
        let p = ProcessDef::new("p", "fn");
        let optional = ProcessDef::new("p", "fn").optional();

        let failed = NodeSnapshot::from_tasks(vec![task(1, "p", "1", TaskExecState::Error)]);
        assert!(matches!(failed.upstream_status(&p), UpstreamStatus::Failed));
        assert!(matches!(failed.upstream_status(&optional), UpstreamStatus::Finished(ref t) if t.is_empty()));

        let ok = NodeSnapshot::from_tasks(vec![task(1, "p", "1", TaskExecState::Ok)]);
        assert!(matches!(ok.upstream_status(&p), UpstreamStatus::Finished(ref t) if t.len() == 1));
        assert!(matches!(
            NodeSnapshot::default().upstream_status(&p),
            UpstreamStatus::Pending
        ));
    }

    #[test]
    fn test_outcome() {
        let graph = ExecGraph::new()
            .with_process(ProcessDef::new("p1", "fn"))
            .validate()
            .unwrap();

        let open = NodeSnapshot::from_tasks(vec![task(1, "p1", "1", TaskExecState::Assigned)]);
        assert_eq!(open.outcome(&graph).0, RunState::Started);

        let ok = NodeSnapshot::from_tasks(vec![task(1, "p1", "1", TaskExecState::Ok)]);
        assert_eq!(ok.outcome(&graph), (RunState::Completed, None));

        let mut failed = task(1, "p1", "1", TaskExecState::Error);
        failed.result = Some(TaskResult::failure("boom"));
        let (state, error) = NodeSnapshot::from_tasks(vec![failed]).outcome(&graph);
        assert_eq!(state, RunState::CompletedWithErrors);
        assert_eq!(error.as_deref(), Some("boom"));
    }
}
