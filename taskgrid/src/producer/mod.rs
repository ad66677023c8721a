//! Task production.
//!
//! A production pass walks the validated graph in topological order and
//! creates a task for every (process, sub-context) whose upstream processes
//! have finished. Inputs are wired to the output variables of the upstream
//! tasks, to run globals or to inline literals. Cacheable processes consult
//! the [`ResultCache`] before their task ever becomes assignable.
//!
//! Callers must hold the run's lock while producing: the store's uniqueness
//! check is the second line of defense, not the first.

mod snapshot;

use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{compute_fingerprint, process_identity, CacheKey, InputFingerprint, ResultCache};
use crate::core::{
    InputLocator, NewTask, RunId, RunState, Task, TaskExecState, TaskInput, TaskOutput, TaskParams, TaskResult,
    VariableId,
};
use crate::errors::{GraphError, StorageError, TaskgridError};
use crate::events::{names, EventSink};
use crate::graph::{BranchContext, Condition, InputBinding, ProcessDef, ValidatedGraph, VariableContext};
use crate::observability::SpanTimer;
use crate::storage::{BlobArea, VariableService};
use crate::store::{Completion, TaskStore};
use crate::utils::now_utc;

pub(crate) use snapshot::NodeSnapshot;
use snapshot::UpstreamStatus;

/// The run a production pass works on.
#[derive(Debug, Clone, Copy)]
pub struct RunContext<'a> {
    /// Run id.
    pub run_id: RunId,
    /// Validated graph of the run.
    pub graph: &'a ValidatedGraph,
    /// Global variables supplied at registration, by declared name.
    pub globals: &'a HashMap<String, VariableId>,
}

/// Terminal verdict of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Derived run state.
    pub state: RunState,
    /// First blocking error, if any.
    pub first_error: Option<String>,
}

/// What a (process, context) needs before it can be produced.
enum Resolution {
    Wait,
    Skip(String),
    Blocked(GraphError),
    Ready(Prepared),
}

struct Prepared {
    inputs: Vec<TaskInput>,
    fingerprints: Vec<(String, InputFingerprint)>,
    inline: BTreeMap<String, String>,
}

/// Materializes tasks for runnable graph nodes.
pub struct TaskProducer {
    tasks: Arc<dyn TaskStore>,
    variables: Arc<VariableService>,
    cache: Arc<ResultCache>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for TaskProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskProducer").finish_non_exhaustive()
    }
}

impl TaskProducer {
    /// Creates a producer.
    #[must_use]
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        variables: Arc<VariableService>,
        cache: Arc<ResultCache>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            tasks,
            variables,
            cache,
            events,
        }
    }

    /// Creates every task that can be created now.
    ///
    /// Runs passes until one creates nothing, so skips and cache hits
    /// unlock their consumers within the same call. Returns the created
    /// tasks in their final state. Calling it again without intervening
    /// results creates nothing.
    ///
    /// A required input that cannot be resolved fails the pass with
    /// [`TaskgridError::Graph`]; tasks created before it stay in the store.
    pub async fn produce_tasks(&self, run: &RunContext<'_>) -> Result<Vec<Task>, TaskgridError> {
        let timer = SpanTimer::start("produce_tasks");
        let mut created = Vec::new();
        loop {
            let mut snapshot = NodeSnapshot::from_tasks(self.tasks.list_run(run.run_id).await?);
            let mut progressed = false;

            for process in run.graph.processes_in_order() {
                let ready = snapshot.ready_contexts(process);
                if ready.is_empty() {
                    continue;
                }
                let contexts = process.branch_contexts();
                for sub_context_id in ready {
                    let Some(context) = contexts.iter().find(|c| c.sub_context_id == sub_context_id) else {
                        continue;
                    };
                    let task = match self.resolve(run, &snapshot, process, context)? {
                        Resolution::Wait => continue,
                        Resolution::Skip(reason) => self.skip(run, process, context, &reason).await?,
                        Resolution::Blocked(e) => {
                            warn!(
                                run_id = %run.run_id,
                                process = %process.code,
                                sub_context = %context.sub_context_id,
                                error = %e,
                                "input cannot be resolved"
                            );
                            return Err(e.into());
                        }
                        Resolution::Ready(prepared) => self.emit_task(run, process, context, prepared).await?,
                    };
                    snapshot.record(task.clone());
                    created.push(task);
                    progressed = true;
                }
            }

            if !progressed {
                break;
            }
        }
        debug!(
            run_id = %run.run_id,
            created = created.len(),
            duration_ms = timer.finish(),
            "production pass finished"
        );
        Ok(created)
    }

    /// Creates a fresh attempt of a failed task.
    ///
    /// The attempt reuses the resolved inputs of `failed`, gets new output
    /// placeholders and skips the cache lookup.
    pub async fn reproduce(&self, failed: &Task) -> Result<Task, TaskgridError> {
        let run_id = failed.run_id();
        let mut params = failed.params.clone();
        for output in &mut params.outputs {
            let context = self
                .variables
                .get(output.variable_id)
                .map_or(VariableContext::Local, |v| v.context);
            let placeholder = self
                .variables
                .create_placeholder(Some(run_id), &output.name, context, BlobArea::Variables)
                .await?;
            output.variable_id = placeholder.id;
        }

        let new = NewTask {
            params,
            state: TaskExecState::None,
            priority: failed.priority,
            topo_index: failed.topo_index,
            tag: failed.tag.clone(),
            cache_fingerprint: failed.cache_fingerprint.clone(),
        };
        let task = self.tasks.insert(new, now_utc()).await?;
        info!(run_id = %run_id, task_id = %task.id, retry_of = %failed.id, "task produced again");
        self.events
            .emit(
                names::TASK_PRODUCED,
                Some(json!({
                    "run_id": run_id,
                    "task_id": task.id,
                    "process": task.process_code(),
                    "sub_context_id": task.sub_context_id(),
                    "retry_of": failed.id,
                })),
            )
            .await;
        Ok(self
            .tasks
            .transition(task.id, TaskExecState::None, TaskExecState::Assignable)
            .await?)
    }

    /// Derives the run state from the store.
    pub async fn outcome(&self, run: &RunContext<'_>) -> Result<RunOutcome, TaskgridError> {
        let snapshot = NodeSnapshot::from_tasks(self.tasks.list_run(run.run_id).await?);
        let (state, first_error) = snapshot.outcome(run.graph);
        Ok(RunOutcome { state, first_error })
    }

    fn resolve(
        &self,
        run: &RunContext<'_>,
        snapshot: &NodeSnapshot,
        process: &ProcessDef,
        context: &BranchContext,
    ) -> Result<Resolution, TaskgridError> {
        let graph = run.graph.graph();
        let mut upstream: HashMap<&str, Vec<Task>> = HashMap::new();
        for code in run.graph.predecessors(&process.code) {
            let Some(producer) = graph.process(code) else {
                continue;
            };
            match snapshot.upstream_status(producer) {
                UpstreamStatus::Finished(tasks) => {
                    upstream.insert(code.as_str(), tasks);
                }
                UpstreamStatus::Pending | UpstreamStatus::Failed => return Ok(Resolution::Wait),
            }
        }

        let mut inline = graph.inline.clone();
        inline.extend(process.inline.iter().map(|(k, v)| (k.clone(), v.clone())));
        inline.extend(context.inline.iter().map(|(k, v)| (k.clone(), v.clone())));

        if let Some(ref condition) = process.condition {
            if !Condition::parse(condition)?.evaluate(&inline) {
                return Ok(Resolution::Skip(format!("condition '{condition}' is false")));
            }
        }

        let mut inputs = Vec::with_capacity(process.inputs.len());
        let mut fingerprints = Vec::with_capacity(process.inputs.len());
        for decl in &process.inputs {
            let binding = run.graph.binding(&process.code, &decl.name);
            let (locator, fingerprint) = match binding {
                Some(InputBinding::Inline) => {
                    let value = inline.get(&decl.name).cloned().unwrap_or_default();
                    let fp = if process.cache.omit_inline {
                        InputFingerprint::InlineOmitted
                    } else {
                        InputFingerprint::Inline(value.clone())
                    };
                    (InputLocator::Inline { value }, fp)
                }
                Some(InputBinding::Global) => match run.globals.get(&decl.name) {
                    Some(&variable_id) => {
                        let fp = self
                            .variables
                            .content_identity(variable_id)?
                            .map_or(InputFingerprint::Null, InputFingerprint::Content);
                        (InputLocator::Global { variable_id }, fp)
                    }
                    None if decl.nullable => (InputLocator::Null, InputFingerprint::Null),
                    None => {
                        return Ok(Resolution::Blocked(GraphError::MissingGlobal {
                            process: process.code.clone(),
                            input: decl.name.clone(),
                        }))
                    }
                },
                Some(InputBinding::Upstream(code)) => {
                    let tasks = match upstream.get(code.as_str()) {
                        Some(tasks) => tasks.clone(),
                        None => match graph.process(code).map(|p| snapshot.upstream_status(p)) {
                            Some(UpstreamStatus::Finished(tasks)) => tasks,
                            _ => return Ok(Resolution::Wait),
                        },
                    };
                    match self.upstream_value(decl.context, &decl.name, &tasks)? {
                        Some(resolved) => resolved,
                        None if decl.nullable => (InputLocator::Null, InputFingerprint::Null),
                        None if tasks.is_empty() => {
                            return Ok(Resolution::Skip(format!("'{code}' was skipped or failed optionally")))
                        }
                        None => {
                            return Ok(Resolution::Blocked(GraphError::MissingUpstreamValue {
                                process: process.code.clone(),
                                input: decl.name.clone(),
                                upstream: code.clone(),
                            }))
                        }
                    }
                }
                None => {
                    return Err(TaskgridError::InvalidRun {
                        run_id: run.run_id,
                        reason: format!("input '{}' of '{}' has no binding", decl.name, process.code),
                    })
                }
            };
            inputs.push(TaskInput {
                name: decl.name.clone(),
                locator,
            });
            fingerprints.push((decl.name.clone(), fingerprint));
        }

        Ok(Resolution::Ready(Prepared {
            inputs,
            fingerprints,
            inline,
        }))
    }

    /// Picks the value of `name` from finished upstream tasks.
    ///
    /// Array inputs collect every branch output; other inputs take the
    /// output of the last branch. Returns `None` when nothing usable exists.
    fn upstream_value(
        &self,
        context: VariableContext,
        name: &str,
        tasks: &[Task],
    ) -> Result<Option<(InputLocator, InputFingerprint)>, StorageError> {
        let ids: Vec<VariableId> = tasks
            .iter()
            .filter_map(|t| t.params.output(name).map(|o| o.variable_id))
            .collect();

        if context == VariableContext::Array {
            if ids.is_empty() {
                return Ok(None);
            }
            let identities = ids
                .iter()
                .map(|id| self.variables.content_identity(*id))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Some((
                InputLocator::Array { variable_ids: ids },
                InputFingerprint::Contents(identities),
            )));
        }

        let Some(&variable_id) = ids.last() else {
            return Ok(None);
        };
        Ok(self
            .variables
            .content_identity(variable_id)?
            .map(|identity| (InputLocator::Variable { variable_id }, InputFingerprint::Content(identity))))
    }

    fn new_task(
        run: &RunContext<'_>,
        process: &ProcessDef,
        state: TaskExecState,
        params: TaskParams,
        cache_fingerprint: Option<String>,
    ) -> NewTask {
        NewTask {
            params,
            state,
            priority: process.priority,
            topo_index: run.graph.topo_index(&process.code).unwrap_or_default(),
            tag: process.tag.clone(),
            cache_fingerprint,
        }
    }

    fn params(
        run: &RunContext<'_>,
        process: &ProcessDef,
        context: &BranchContext,
        inputs: Vec<TaskInput>,
        outputs: Vec<TaskOutput>,
        inline: BTreeMap<String, String>,
    ) -> TaskParams {
        TaskParams {
            run_id: run.run_id,
            process_code: process.code.clone(),
            sub_context_id: context.sub_context_id.clone(),
            function: process.function.clone(),
            pre_functions: process.pre_functions.clone(),
            post_functions: process.post_functions.clone(),
            inputs,
            outputs,
            inline,
            timeout_secs: process.timeout_secs,
        }
    }

    async fn skip(
        &self,
        run: &RunContext<'_>,
        process: &ProcessDef,
        context: &BranchContext,
        reason: &str,
    ) -> Result<Task, TaskgridError> {
        let params = Self::params(run, process, context, Vec::new(), Vec::new(), BTreeMap::new());
        let new = Self::new_task(run, process, TaskExecState::Skipped, params, None);
        let task = self.tasks.insert(new, now_utc()).await?;
        info!(
            run_id = %run.run_id,
            task_id = %task.id,
            process = %process.code,
            sub_context = %context.sub_context_id,
            reason,
            "task skipped"
        );
        self.events
            .emit(
                names::TASK_PRODUCED,
                Some(json!({
                    "run_id": run.run_id,
                    "task_id": task.id,
                    "process": process.code,
                    "sub_context_id": context.sub_context_id,
                    "state": task.exec_state,
                    "reason": reason,
                })),
            )
            .await;
        Ok(task)
    }

    async fn emit_task(
        &self,
        run: &RunContext<'_>,
        process: &ProcessDef,
        context: &BranchContext,
        prepared: Prepared,
    ) -> Result<Task, TaskgridError> {
        let mut outputs = Vec::with_capacity(process.outputs.len());
        for decl in &process.outputs {
            let variable = self
                .variables
                .create_placeholder(Some(run.run_id), &decl.name, decl.context, BlobArea::Variables)
                .await?;
            outputs.push(TaskOutput {
                name: decl.name.clone(),
                variable_id: variable.id,
                nullable: decl.nullable,
            });
        }

        let cache_key = if process.cache.enabled {
            Some(CacheKey::new(
                process_identity(&process.function),
                compute_fingerprint(process, &prepared.fingerprints, &prepared.inline)?,
            ))
        } else {
            None
        };

        let params = Self::params(run, process, context, prepared.inputs, outputs, prepared.inline);
        let new = Self::new_task(
            run,
            process,
            TaskExecState::None,
            params,
            cache_key.as_ref().map(|k| k.fingerprint.clone()),
        );
        let task = self.tasks.insert(new, now_utc()).await?;
        debug!(
            run_id = %run.run_id,
            task_id = %task.id,
            process = %process.code,
            sub_context = %context.sub_context_id,
            "task produced"
        );
        self.events
            .emit(
                names::TASK_PRODUCED,
                Some(json!({
                    "run_id": run.run_id,
                    "task_id": task.id,
                    "process": process.code,
                    "sub_context_id": context.sub_context_id,
                })),
            )
            .await;

        match cache_key {
            None => Ok(self
                .tasks
                .transition(task.id, TaskExecState::None, TaskExecState::Assignable)
                .await?),
            Some(key) => self.check_cache(run, task, &key).await,
        }
    }

    async fn check_cache(&self, run: &RunContext<'_>, task: Task, key: &CacheKey) -> Result<Task, TaskgridError> {
        let task = self
            .tasks
            .transition(task.id, TaskExecState::None, TaskExecState::InCacheCheck)
            .await?;

        let Some(entry) = self.cache.lookup(key) else {
            return Ok(self
                .tasks
                .transition(task.id, TaskExecState::InCacheCheck, TaskExecState::Assignable)
                .await?);
        };

        let (state, result) = match self.cache.materialize(&entry, &task.params.outputs).await {
            Ok(()) => (TaskExecState::Ok, TaskResult::cached()),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "cache hit could not be materialized");
                (TaskExecState::Error, TaskResult::failure(e.to_string()))
            }
        };
        let task = self
            .tasks
            .complete(
                task.id,
                Completion {
                    from: TaskExecState::InCacheCheck,
                    worker: None,
                    state,
                    result,
                    at: now_utc(),
                },
            )
            .await?;
        if task.exec_state == TaskExecState::Ok {
            info!(run_id = %run.run_id, task_id = %task.id, fingerprint = %key.fingerprint, "task completed from cache");
            self.events
                .emit(
                    names::TASK_CACHE_HIT,
                    Some(json!({
                        "run_id": run.run_id,
                        "task_id": task.id,
                        "fingerprint": key.fingerprint,
                    })),
                )
                .await;
        }
        Ok(task)
    }
}
