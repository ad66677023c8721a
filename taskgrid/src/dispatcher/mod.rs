//! The dispatcher.
//!
//! Owns registered runs, hands tasks to polling workers and accepts their
//! results. Every mutation of a run's task set happens under that run's
//! lock, so production and assignment of one run are linearizable while
//! different runs proceed in parallel.

#[cfg(feature = "server")]
mod http;
mod protocol;
mod sessions;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[cfg(feature = "server")]
pub use http::{router, serve};
pub use protocol::{
    decode, encode, Assignment, OutputData, OutputPayload, ReportedState, RequestBody, RequestEnvelope,
    ResponseBody, ResultReport, WorkerStatus, SESSION_ID_HEADER, WORKER_ID_HEADER,
};
pub use sessions::SessionRegistry;

use crate::cache::{process_identity, CacheKey, ResultCache};
use crate::config::DispatcherConfig;
use crate::core::{IdSequence, RunId, RunState, Task, TaskExecState, TaskId, TaskResult, VariableId, WorkerId};
use crate::errors::{GraphError, StorageError, StoreError, TaskgridError};
use crate::events::{names, EventSink, LoggingEventSink};
use crate::graph::{ExecGraph, ValidatedGraph, VariableContext};
use crate::producer::{RunContext, TaskProducer};
use crate::storage::{open_storage, BlobArea, BlobKey, BlobStorage, VariableService};
use crate::store::{Completion, InMemoryTaskStore, TaskStore};
use crate::utils::{elapsed_longer_than, now_utc, Timestamp};

#[derive(Debug)]
struct RunEntry {
    graph: Option<Arc<ValidatedGraph>>,
    globals: HashMap<String, VariableId>,
    state: RunState,
    first_error: Option<String>,
}

/// Externally visible state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunStatus {
    /// Run id.
    pub run_id: RunId,
    /// Current state.
    pub state: RunState,
    /// First blocking error, for failed or invalid runs.
    pub first_error: Option<String>,
}

/// Central coordinator of runs and workers.
pub struct Dispatcher {
    config: DispatcherConfig,
    tasks: Arc<dyn TaskStore>,
    variables: Arc<VariableService>,
    cache: Arc<ResultCache>,
    producer: TaskProducer,
    events: Arc<dyn EventSink>,
    runs: DashMap<RunId, Arc<Mutex<RunEntry>>>,
    run_ids: IdSequence,
    sessions: SessionRegistry,
    functions: DashMap<String, u64>,
    function_ids: IdSequence,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("runs", &self.runs.len())
            .field("sessions", &self.sessions.len())
            .field("functions", &self.functions.len())
            .field("variables", &self.variables)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher over explicit collaborators.
    #[must_use]
    pub fn new(
        config: DispatcherConfig,
        tasks: Arc<dyn TaskStore>,
        storage: Arc<dyn BlobStorage>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let variables = Arc::new(VariableService::new(storage).with_timeout(config.storage_timeout()));
        let cache = Arc::new(ResultCache::new(Arc::clone(&variables)));
        let producer = TaskProducer::new(
            Arc::clone(&tasks),
            Arc::clone(&variables),
            Arc::clone(&cache),
            Arc::clone(&events),
        );
        let sessions = SessionRegistry::new(config.session_ttl());
        Self {
            config,
            tasks,
            variables,
            cache,
            producer,
            events,
            runs: DashMap::new(),
            run_ids: IdSequence::default(),
            sessions,
            functions: DashMap::new(),
            function_ids: IdSequence::default(),
        }
    }

    /// Creates a dispatcher with the configured storage backend, an
    /// in-memory task store and a logging event sink.
    pub fn from_config(config: DispatcherConfig) -> Result<Self, TaskgridError> {
        let storage = open_storage(&config.storage)?;
        Ok(Self::new(
            config,
            Arc::new(InMemoryTaskStore::new()),
            storage,
            Arc::new(LoggingEventSink::default()),
        ))
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// The variable service.
    #[must_use]
    pub fn variables(&self) -> &Arc<VariableService> {
        &self.variables
    }

    /// The result cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// The worker sessions.
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    fn run_entry(&self, run_id: RunId) -> Option<Arc<Mutex<RunEntry>>> {
        self.runs.get(&run_id).map(|e| Arc::clone(e.value()))
    }

    /// Registers a run and produces its first tasks.
    ///
    /// `globals` supplies the bytes of the graph's declared globals. A graph
    /// that fails validation, or that consumes a required global missing
    /// from `globals`, is recorded as [`RunState::Invalid`] and produces
    /// nothing; the returned status carries the reason.
    pub async fn register_run(
        &self,
        graph: ExecGraph,
        globals: HashMap<String, Vec<u8>>,
    ) -> Result<RunStatus, TaskgridError> {
        let run_id = RunId::new(self.run_ids.next_id());
        let validated = match graph.validate() {
            Ok(validated) => validated,
            Err(e) => return Ok(self.reject_run(run_id, &e).await),
        };

        if let Err(e) = validated.check_globals(|name| globals.contains_key(name)) {
            return Ok(self.reject_run(run_id, &e).await);
        }

        let mut global_ids = HashMap::new();
        for (name, bytes) in globals {
            if !validated.graph().globals.contains(&name) {
                warn!(run_id = %run_id, global = %name, "ignoring undeclared global");
                continue;
            }
            let variable = self
                .variables
                .create_with_data(Some(run_id), &name, VariableContext::Global, BlobArea::GlobalVariables, bytes)
                .await?;
            global_ids.insert(name, variable.id);
        }

        let entry = Arc::new(Mutex::new(RunEntry {
            graph: Some(Arc::new(validated)),
            globals: global_ids,
            state: RunState::Producing,
            first_error: None,
        }));
        self.runs.insert(run_id, Arc::clone(&entry));

        let mut guard = entry.lock().await;
        info!(run_id = %run_id, "run registered");
        self.events
            .emit(
                names::RUN_REGISTERED,
                Some(json!({ "run_id": run_id, "state": RunState::Producing })),
            )
            .await;
        self.advance(run_id, &mut guard).await?;
        Ok(status_of(run_id, &guard))
    }

    /// Records a run that fails an integrity check before producing anything.
    async fn reject_run(&self, run_id: RunId, error: &GraphError) -> RunStatus {
        let info = error.error_info();
        warn!(run_id = %run_id, code = %info.code, error = %error, "run rejected");
        self.runs.insert(
            run_id,
            Arc::new(Mutex::new(RunEntry {
                graph: None,
                globals: HashMap::new(),
                state: RunState::Invalid,
                first_error: Some(error.to_string()),
            })),
        );
        self.events
            .emit(
                names::RUN_REGISTERED,
                Some(json!({ "run_id": run_id, "state": RunState::Invalid, "error": info })),
            )
            .await;
        RunStatus {
            run_id,
            state: RunState::Invalid,
            first_error: Some(error.to_string()),
        }
    }

    /// Produces what can be produced and updates the run state.
    async fn advance(&self, run_id: RunId, entry: &mut RunEntry) -> Result<(), TaskgridError> {
        let Some(graph) = entry.graph.clone() else {
            return Ok(());
        };
        let run = RunContext {
            run_id,
            graph: &graph,
            globals: &entry.globals,
        };
        let was_finished = entry.state.is_finished();
        match self.producer.produce_tasks(&run).await {
            Ok(_) => {
                let outcome = self.producer.outcome(&run).await?;
                entry.state = outcome.state;
                entry.first_error = outcome.first_error;
            }
            Err(TaskgridError::Graph(e)) => {
                warn!(run_id = %run_id, code = %e.error_info().code, error = %e, "run invalidated");
                entry.state = RunState::Invalid;
                entry.first_error = Some(e.to_string());
            }
            Err(e) => return Err(e),
        }
        if entry.state.is_finished() && !was_finished {
            info!(run_id = %run_id, state = %entry.state, "run finished");
            self.events
                .emit(
                    names::RUN_COMPLETED,
                    Some(json!({
                        "run_id": run_id,
                        "state": entry.state,
                        "first_error": entry.first_error,
                    })),
                )
                .await;
        }
        Ok(())
    }

    /// Current state of a run.
    pub async fn run_status(&self, run_id: RunId) -> Result<RunStatus, TaskgridError> {
        let entry = self.run_entry(run_id).ok_or(TaskgridError::UnknownRun(run_id))?;
        let guard = entry.lock().await;
        Ok(status_of(run_id, &guard))
    }

    /// Every task of a run, ordered by id.
    pub async fn run_tasks(&self, run_id: RunId) -> Result<Vec<Task>, TaskgridError> {
        Ok(self.tasks.list_run(run_id).await?)
    }

    fn authenticate(
        &self,
        worker_id: Option<WorkerId>,
        session_id: Option<&str>,
        now: Timestamp,
    ) -> Option<(WorkerId, Vec<String>)> {
        let worker_id = worker_id?;
        let tags = self.sessions.touch(worker_id, session_id?, now)?;
        Some((worker_id, tags))
    }

    /// Handles one request envelope.
    pub async fn handle(&self, request: RequestEnvelope) -> Result<ResponseBody, TaskgridError> {
        let now = now_utc();
        let session_id = request.session_id.as_deref();
        match request.body {
            RequestBody::Identify { tags } => {
                let (worker_id, session_id) = self.sessions.identify(tags, now);
                info!(worker_id = %worker_id, "worker identified");
                Ok(ResponseBody::Identity { worker_id, session_id })
            }
            RequestBody::Poll => self.handle_poll(request.worker_id, session_id).await,
            RequestBody::ReportResult { task_id, result } => {
                let Some((worker_id, _)) = self.authenticate(request.worker_id, session_id, now) else {
                    return Ok(ResponseBody::ReIdentify);
                };
                let accepted = self.handle_result(worker_id, task_id, result).await?;
                Ok(ResponseBody::Ack { accepted })
            }
            RequestBody::ReportStatus { status } => {
                let Some((worker_id, _)) = self.authenticate(request.worker_id, session_id, now) else {
                    return Ok(ResponseBody::ReIdentify);
                };
                debug!(worker_id = %worker_id, active = status.task_ids.len(), "worker status");
                self.sessions.update_tags(worker_id, status.tags);
                Ok(ResponseBody::Ack { accepted: true })
            }
            RequestBody::Empty => Ok(ResponseBody::Empty),
        }
    }

    /// Hands at most one task to a worker.
    ///
    /// Returns [`ResponseBody::ReIdentify`] for a missing or stale session,
    /// [`ResponseBody::Task`] on assignment and [`ResponseBody::Empty`] when
    /// nothing suitable is assignable. Candidates are ordered by priority
    /// (highest first), topological position, then id.
    pub async fn handle_poll(
        &self,
        worker_id: Option<WorkerId>,
        session_id: Option<&str>,
    ) -> Result<ResponseBody, TaskgridError> {
        let now = now_utc();
        let Some((worker_id, tags)) = self.authenticate(worker_id, session_id, now) else {
            return Ok(ResponseBody::ReIdentify);
        };

        let mut candidates: Vec<Task> = self
            .tasks
            .list_in_state(TaskExecState::Assignable)
            .await?
            .into_iter()
            .filter(|t| t.tag_allowed(&tags))
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.topo_index.cmp(&b.topo_index))
                .then(a.id.cmp(&b.id))
        });

        for candidate in candidates {
            let Some(entry) = self.run_entry(candidate.run_id()) else {
                continue;
            };
            let guard = entry.lock().await;
            if guard.state == RunState::Invalid {
                continue;
            }
            match self.tasks.assign(candidate.id, worker_id, now).await {
                Ok(task) => {
                    drop(guard);
                    info!(
                        run_id = %task.run_id(),
                        task_id = %task.id,
                        worker_id = %worker_id,
                        process = %task.process_code(),
                        "task assigned"
                    );
                    self.events
                        .emit(
                            names::TASK_ASSIGNED,
                            Some(json!({ "run_id": task.run_id(), "task_id": task.id, "worker_id": worker_id })),
                        )
                        .await;
                    return Ok(ResponseBody::Task(Assignment {
                        task_id: task.id,
                        params: task.params.to_wire()?,
                    }));
                }
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(ResponseBody::Empty)
    }

    /// Accepts the result of a task.
    ///
    /// Returns `false` without changing anything if the task is unknown,
    /// not `ASSIGNED`, or held by another worker. On acceptance the outputs
    /// are written, the task reaches a terminal state and downstream tasks
    /// of the run are produced.
    pub async fn handle_result(
        &self,
        worker_id: WorkerId,
        task_id: TaskId,
        report: ResultReport,
    ) -> Result<bool, TaskgridError> {
        let Some(task) = self.tasks.get(task_id).await? else {
            return Ok(self.reject(worker_id, task_id, "unknown task").await);
        };
        let run_id = task.run_id();
        let Some(entry) = self.run_entry(run_id) else {
            return Ok(self.reject(worker_id, task_id, "unknown run").await);
        };
        let mut guard = entry.lock().await;

        let Some(task) = self.tasks.get(task_id).await? else {
            return Ok(self.reject(worker_id, task_id, "unknown task").await);
        };
        if task.exec_state != TaskExecState::Assigned || task.assigned_worker != Some(worker_id) {
            return Ok(self.reject(worker_id, task_id, "task is not held by this worker").await);
        }

        let (state, result) = self.store_outputs(&task, &report).await;
        let completion = Completion {
            from: TaskExecState::Assigned,
            worker: Some(worker_id),
            state,
            result,
            at: now_utc(),
        };
        let task = match self.tasks.complete(task_id, completion).await {
            Ok(task) => task,
            Err(StoreError::Conflict(_)) => {
                return Ok(self.reject(worker_id, task_id, "task changed while reporting").await)
            }
            Err(e) => return Err(e.into()),
        };
        info!(run_id = %run_id, task_id = %task_id, worker_id = %worker_id, state = %task.exec_state, "task finished");
        self.events
            .emit(
                names::TASK_FINISHED,
                Some(json!({
                    "run_id": run_id,
                    "task_id": task_id,
                    "worker_id": worker_id,
                    "state": task.exec_state,
                })),
            )
            .await;

        if task.exec_state == TaskExecState::Ok {
            if let Some(ref fingerprint) = task.cache_fingerprint {
                let key = CacheKey::new(process_identity(&task.params.function), fingerprint.clone());
                if let Err(e) = self.cache.store(key, &task.params.outputs).await {
                    warn!(task_id = %task_id, error = %e, "result not cached");
                }
            }
        }

        self.advance(run_id, &mut guard).await?;
        Ok(true)
    }

    /// Writes reported outputs into the task's placeholders.
    ///
    /// An `OK` report that lacks a non-nullable output, or whose bytes
    /// cannot be stored, turns into `ERROR`.
    async fn store_outputs(&self, task: &Task, report: &ResultReport) -> (TaskExecState, TaskResult) {
        let mut result = TaskResult {
            exit_code: report.exit_code,
            console: report.console.clone(),
            from_cache: false,
        };
        if report.state == ReportedState::Error {
            return (TaskExecState::Error, result);
        }

        let mut problems = Vec::new();
        for output in &task.params.outputs {
            let written = match report.output(&output.name) {
                Some(OutputPayload::Bytes(bytes)) => self.variables.fill(output.variable_id, bytes.clone()).await,
                Some(OutputPayload::Nullified) | None if output.nullable => {
                    self.variables.nullify(output.variable_id).await
                }
                Some(OutputPayload::Nullified) | None => {
                    problems.push(format!("required output '{}' is missing", output.name));
                    continue;
                }
            };
            if let Err(e) = written {
                problems.push(format!("output '{}': {e}", output.name));
            }
        }

        if problems.is_empty() {
            return (TaskExecState::Ok, result);
        }
        warn!(task_id = %task.id, problems = ?problems, "result turned into an error");
        if !result.console.is_empty() {
            result.console.push('\n');
        }
        result.console.push_str(&problems.join("\n"));
        (TaskExecState::Error, result)
    }

    async fn reject(&self, worker_id: WorkerId, task_id: TaskId, reason: &str) -> bool {
        warn!(task_id = %task_id, worker_id = %worker_id, reason, "result rejected");
        self.events
            .emit(
                names::TASK_RESULT_REJECTED,
                Some(json!({ "task_id": task_id, "worker_id": worker_id, "reason": reason })),
            )
            .await;
        false
    }

    /// Serves the bytes of an input variable to an identified worker.
    pub async fn fetch_variable(
        &self,
        worker_id: WorkerId,
        session_id: &str,
        variable_id: VariableId,
    ) -> Result<Vec<u8>, TaskgridError> {
        if self.authenticate(Some(worker_id), Some(session_id), now_utc()).is_none() {
            return Err(TaskgridError::StaleSession(worker_id));
        }
        Ok(self.variables.read(variable_id).await?)
    }

    /// Stores the binary of a dispatcher-sourced function, replacing any
    /// earlier upload under the same code.
    pub async fn store_function(&self, code: &str, bytes: Vec<u8>) -> Result<(), TaskgridError> {
        let id = *self
            .functions
            .entry(code.to_string())
            .or_insert_with(|| self.function_ids.next_id());
        let size = bytes.len();
        self.variables
            .store_blob(&BlobKey::new(BlobArea::Functions, id), bytes)
            .await?;
        info!(function = %code, size, "function stored");
        Ok(())
    }

    /// Returns a function binary to an authenticated worker.
    pub async fn fetch_function(
        &self,
        worker_id: WorkerId,
        session_id: &str,
        code: &str,
    ) -> Result<Vec<u8>, TaskgridError> {
        if self.authenticate(Some(worker_id), Some(session_id), now_utc()).is_none() {
            return Err(TaskgridError::StaleSession(worker_id));
        }
        let id = self
            .functions
            .get(code)
            .map(|e| *e.value())
            .ok_or_else(|| StorageError::DataNotFound(format!("function '{code}'")))?;
        Ok(self.variables.read_blob(&BlobKey::new(BlobArea::Functions, id)).await?)
    }

    /// Produces a fresh attempt of a failed task.
    ///
    /// Allowed while the number of failed attempts of the same (process,
    /// sub-context) does not exceed the process's `tries_after_error`. The
    /// run leaves its terminal state.
    pub async fn retry_task(&self, task_id: TaskId) -> Result<Task, TaskgridError> {
        let task = self.tasks.get(task_id).await?.ok_or(StoreError::UnknownTask(task_id))?;
        let run_id = task.run_id();
        let entry = self.run_entry(run_id).ok_or(TaskgridError::UnknownRun(run_id))?;
        let mut guard = entry.lock().await;
        let Some(graph) = guard.graph.clone() else {
            return Err(TaskgridError::InvalidRun {
                run_id,
                reason: guard.first_error.clone().unwrap_or_default(),
            });
        };

        let siblings: Vec<Task> = self
            .tasks
            .list_run(run_id)
            .await?
            .into_iter()
            .filter(|t| t.key() == task.key())
            .collect();
        let latest = siblings.iter().max_by_key(|t| t.id).map_or(task_id, |t| t.id);
        let current = siblings
            .iter()
            .find(|t| t.id == task_id)
            .ok_or(StoreError::UnknownTask(task_id))?;
        if current.exec_state != TaskExecState::Error || latest != task_id {
            return Err(StoreError::IllegalTransition {
                task_id,
                from: current.exec_state,
                to: TaskExecState::Assignable,
            }
            .into());
        }

        let attempts = u32::try_from(
            siblings
                .iter()
                .filter(|t| t.exec_state == TaskExecState::Error)
                .count(),
        )
        .unwrap_or(u32::MAX);
        let allowed = graph
            .graph()
            .process(task.process_code())
            .map_or(0, |p| p.tries_after_error);
        if attempts > allowed {
            return Err(TaskgridError::RetryExhausted {
                task_id,
                attempts,
                allowed,
            });
        }

        let fresh = self.producer.reproduce(current).await?;
        info!(run_id = %run_id, task_id = %fresh.id, retry_of = %task_id, attempts, "task retried");
        guard.state = RunState::Started;
        guard.first_error = None;
        self.advance(run_id, &mut guard).await?;
        Ok(fresh)
    }

    /// Returns stale assignments to `ASSIGNABLE`.
    ///
    /// A task is stale when it has been assigned for longer than
    /// `threshold`, or than its own timeout if that is shorter.
    pub async fn reclaim_stale(&self, threshold: Duration) -> Result<Vec<TaskId>, TaskgridError> {
        let now = now_utc();
        let mut reclaimed = Vec::new();
        for task in self.tasks.list_in_state(TaskExecState::Assigned).await? {
            let (Some(worker_id), Some(assigned_on)) = (task.assigned_worker, task.assigned_on) else {
                continue;
            };
            let limit = task
                .params
                .timeout_secs
                .map_or(threshold, |secs| threshold.min(Duration::from_secs(secs)));
            if !elapsed_longer_than(assigned_on, now, limit) {
                continue;
            }
            let Some(entry) = self.run_entry(task.run_id()) else {
                continue;
            };
            let _guard = entry.lock().await;
            match self.tasks.reclaim(task.id, worker_id).await {
                Ok(_) => {
                    warn!(run_id = %task.run_id(), task_id = %task.id, worker_id = %worker_id, "stale task reclaimed");
                    self.events
                        .emit(
                            names::TASK_RECLAIMED,
                            Some(json!({ "run_id": task.run_id(), "task_id": task.id, "worker_id": worker_id })),
                        )
                        .await;
                    reclaimed.push(task.id);
                }
                Err(StoreError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(reclaimed)
    }

    /// Drops sessions idle past the TTL. Returns how many.
    pub fn evict_expired_sessions(&self, now: Timestamp) -> usize {
        let evicted = self.sessions.evict_expired(now);
        if evicted > 0 {
            info!(evicted, "expired sessions dropped");
            self.events.try_emit(names::SESSIONS_EVICTED, Some(json!({ "count": evicted })));
        }
        evicted
    }

    /// Deletes every task and variable of a run. Returns the number of tasks removed.
    pub async fn delete_run_tasks(&self, run_id: RunId) -> Result<usize, TaskgridError> {
        let entry = self.run_entry(run_id).ok_or(TaskgridError::UnknownRun(run_id))?;
        let _guard = entry.lock().await;
        let tasks = self.tasks.delete_run(run_id).await?;
        let variables = self.variables.delete_run(run_id).await;
        info!(run_id = %run_id, tasks, variables, "run artifacts deleted");
        Ok(tasks)
    }
}

fn status_of(run_id: RunId, entry: &RunEntry) -> RunStatus {
    RunStatus {
        run_id,
        state: entry.state,
        first_error: entry.first_error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskParams;
    use crate::events::CollectingEventSink;
    use crate::graph::{Branch, ProcessDef, VariableDecl};
    use crate::storage::DatabaseBlobStorage;
    use crate::testing::{cached_graph, linear_graph};
    use pretty_assertions::assert_eq;

    fn dispatcher(events: Arc<CollectingEventSink>) -> Dispatcher {
        Dispatcher::new(
            DispatcherConfig::default(),
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(DatabaseBlobStorage::in_memory().unwrap()),
            events,
        )
    }

    async fn identify(d: &Dispatcher, tags: &[&str]) -> (WorkerId, String) {
        let body = RequestBody::Identify {
            tags: tags.iter().map(ToString::to_string).collect(),
        };
        match d.handle(RequestEnvelope::anonymous(body)).await.unwrap() {
            ResponseBody::Identity { worker_id, session_id } => (worker_id, session_id),
            other => panic!("unexpected response {other:?}"),
        }
    }

    async fn poll(d: &Dispatcher, worker: &(WorkerId, String)) -> Option<(TaskId, TaskParams)> {
        match d.handle_poll(Some(worker.0), Some(&worker.1)).await.unwrap() {
            ResponseBody::Task(a) => Some((a.task_id, TaskParams::from_wire(&a.params).unwrap())),
            ResponseBody::Empty => None,
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_poll_without_session_gets_reidentify() {
        let d = dispatcher(Arc::new(CollectingEventSink::new()));
        assert_eq!(d.handle_poll(None, None).await.unwrap(), ResponseBody::ReIdentify);
        let (worker, _) = identify(&d, &[]).await;
        assert_eq!(
            d.handle_poll(Some(worker), Some("stale")).await.unwrap(),
            ResponseBody::ReIdentify
        );
    }

    #[tokio::test]
    async fn test_result_from_non_holder_is_rejected() {
        let events = Arc::new(CollectingEventSink::new());
        let d = dispatcher(Arc::clone(&events));
        let run = d.register_run(linear_graph(2), HashMap::new()).await.unwrap();
        let a = identify(&d, &[]).await;
        let b = identify(&d, &[]).await;

        let (task_id, _) = poll(&d, &a).await.unwrap();
        assert!(poll(&d, &b).await.is_none());

        let accepted = d
            .handle_result(b.0, task_id, ResultReport::ok(Vec::new()).with_bytes("out1", b"x".to_vec()))
            .await
            .unwrap();
        assert!(!accepted);
        let task = d.tasks.get(task_id).await.unwrap().unwrap();
        assert_eq!(task.exec_state, TaskExecState::Assigned);
        assert_eq!(task.assigned_worker, Some(a.0));
        assert_eq!(events.count(names::TASK_RESULT_REJECTED), 1);

        assert!(d
            .handle_result(a.0, task_id, ResultReport::ok(Vec::new()).with_bytes("out1", b"x".to_vec()))
            .await
            .unwrap());
        assert!(!d
            .handle_result(a.0, task_id, ResultReport::ok(Vec::new()))
            .await
            .unwrap());
        assert_eq!(d.run_status(run.run_id).await.unwrap().state, RunState::Started);
    }

    #[tokio::test]
    async fn test_tags_and_priority_order() {
        let d = dispatcher(Arc::new(CollectingEventSink::new()));
        let graph = ExecGraph::new()
            .with_process(ProcessDef::new("low", "fn"))
            .with_process(ProcessDef::new("high", "fn").with_priority(10))
            .with_process(ProcessDef::new("gpu", "fn").with_tag("gpu").with_priority(100));
        d.register_run(graph, HashMap::new()).await.unwrap();

        let plain = identify(&d, &[]).await;
        let gpu = identify(&d, &["gpu"]).await;

        assert_eq!(poll(&d, &plain).await.unwrap().1.process_code, "high");
        assert_eq!(poll(&d, &gpu).await.unwrap().1.process_code, "gpu");
        assert_eq!(poll(&d, &plain).await.unwrap().1.process_code, "low");
        assert!(poll(&d, &gpu).await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_graph_marks_run_invalid() {
        let events = Arc::new(CollectingEventSink::new());
        let d = dispatcher(Arc::clone(&events));
        let graph = ExecGraph::new()
            .with_process(ProcessDef::new("a", "fn").with_input(VariableDecl::local("x")))
            .with_process(ProcessDef::new("b", "fn").with_input(VariableDecl::local("x")))
            .with_edge("a", "b")
            .with_edge("b", "a");

        let status = d.register_run(graph, HashMap::new()).await.unwrap();
        assert_eq!(status.state, RunState::Invalid);
        assert!(status.first_error.unwrap().contains("cycle"));
        assert!(d.run_tasks(status.run_id).await.unwrap().is_empty());

        let registered = events.named(names::RUN_REGISTERED);
        assert_eq!(registered[0].data.as_ref().unwrap()["error"]["code"], "GRAPH-001-CYCLE");
    }

    #[tokio::test]
    async fn test_missing_required_global_marks_run_invalid() {
        let events = Arc::new(CollectingEventSink::new());
        let d = dispatcher(Arc::clone(&events));

        let status = d.register_run(cached_graph(), HashMap::new()).await.unwrap();
        assert_eq!(status.state, RunState::Invalid);
        assert!(status.first_error.unwrap().contains("seed"));
        assert!(d.run_tasks(status.run_id).await.unwrap().is_empty());

        let registered = events.named(names::RUN_REGISTERED);
        assert_eq!(registered[0].data.as_ref().unwrap()["error"]["code"], "GRAPH-007-MISSING_GLOBAL");
    }

    #[tokio::test]
    async fn test_upstream_without_value_invalidates_run() {
        let events = Arc::new(CollectingEventSink::new());
        let d = dispatcher(Arc::clone(&events));
        let graph = ExecGraph::new()
            .with_process(ProcessDef::new("p1", "fn.p1").with_output(VariableDecl::local("x").nullable()))
            .with_process(ProcessDef::new("p2", "fn.p2").with_input(VariableDecl::local("x")))
            .with_edge("p1", "p2");
        let run = d.register_run(graph, HashMap::new()).await.unwrap();
        let worker = identify(&d, &[]).await;

        let (task_id, _) = poll(&d, &worker).await.unwrap();
        assert!(d
            .handle_result(worker.0, task_id, ResultReport::ok(Vec::new()).with_nullified("x"))
            .await
            .unwrap());

        let status = d.run_status(run.run_id).await.unwrap();
        assert_eq!(status.state, RunState::Invalid);
        assert!(status.first_error.unwrap().contains("'p1'"));
        assert_eq!(d.run_tasks(run.run_id).await.unwrap().len(), 1);
        assert_eq!(events.count(names::RUN_COMPLETED), 1);
        assert!(poll(&d, &worker).await.is_none());
    }

    #[tokio::test]
    async fn test_sequential_error_ends_run_with_errors() {
        let d = dispatcher(Arc::new(CollectingEventSink::new()));
        let graph = ExecGraph::new().with_process(ProcessDef::new("seq", "fn.seq").sequential(vec![
            Branch::new("a"),
            Branch::new("b"),
            Branch::new("c"),
        ]));
        let run = d.register_run(graph, HashMap::new()).await.unwrap();
        let worker = identify(&d, &[]).await;

        let (first, params) = poll(&d, &worker).await.unwrap();
        assert_eq!(params.sub_context_id, "1,1");
        assert!(d.handle_result(worker.0, first, ResultReport::ok(Vec::new())).await.unwrap());

        let (second, params) = poll(&d, &worker).await.unwrap();
        assert_eq!(params.sub_context_id, "1,2");
        assert!(d
            .handle_result(worker.0, second, ResultReport::error(3, "branch b failed"))
            .await
            .unwrap());

        assert!(poll(&d, &worker).await.is_none());
        assert_eq!(
            d.run_status(run.run_id).await.unwrap(),
            RunStatus {
                run_id: run.run_id,
                state: RunState::CompletedWithErrors,
                first_error: Some("branch b failed".into()),
            }
        );
        assert_eq!(d.run_tasks(run.run_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_required_output_turns_into_error() {
        let d = dispatcher(Arc::new(CollectingEventSink::new()));
        let run = d.register_run(linear_graph(1), HashMap::new()).await.unwrap();
        let worker = identify(&d, &[]).await;
        let (task_id, _) = poll(&d, &worker).await.unwrap();

        assert!(d
            .handle_result(worker.0, task_id, ResultReport::ok(Vec::new()))
            .await
            .unwrap());
        let task = d.tasks.get(task_id).await.unwrap().unwrap();
        assert_eq!(task.exec_state, TaskExecState::Error);
        assert!(task.result.unwrap().console.contains("out1"));

        let status = d.run_status(run.run_id).await.unwrap();
        assert_eq!(status.state, RunState::CompletedWithErrors);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let d = dispatcher(Arc::new(CollectingEventSink::new()));
        let graph = ExecGraph::new().with_process(
            ProcessDef::new("flaky", "fn")
                .with_output(VariableDecl::local("out"))
                .with_tries_after_error(1),
        );
        let run = d.register_run(graph, HashMap::new()).await.unwrap();
        let worker = identify(&d, &[]).await;

        let (first, _) = poll(&d, &worker).await.unwrap();
        d.handle_result(worker.0, first, ResultReport::error(1, "boom")).await.unwrap();
        assert_eq!(
            d.run_status(run.run_id).await.unwrap(),
            RunStatus {
                run_id: run.run_id,
                state: RunState::CompletedWithErrors,
                first_error: Some("boom".into()),
            }
        );

        let fresh = d.retry_task(first).await.unwrap();
        assert_eq!(fresh.exec_state, TaskExecState::Assignable);
        assert_eq!(d.run_status(run.run_id).await.unwrap().state, RunState::Started);

        let (second, _) = poll(&d, &worker).await.unwrap();
        assert_eq!(second, fresh.id);
        d.handle_result(worker.0, second, ResultReport::error(1, "boom again"))
            .await
            .unwrap();
        assert!(matches!(
            d.retry_task(second).await,
            Err(TaskgridError::RetryExhausted { attempts: 2, allowed: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_idle_sessions_are_evicted() {
        let events = Arc::new(CollectingEventSink::new());
        let d = dispatcher(Arc::clone(&events));
        let worker = identify(&d, &[]).await;

        assert_eq!(d.evict_expired_sessions(now_utc()), 0);
        let later = now_utc() + chrono::Duration::seconds(i64::try_from(d.config().session_ttl_secs).unwrap() + 1);
        assert_eq!(d.evict_expired_sessions(later), 1);
        assert_eq!(events.count(names::SESSIONS_EVICTED), 1);
        assert_eq!(d.handle_poll(Some(worker.0), Some(&worker.1)).await.unwrap(), ResponseBody::ReIdentify);
    }

    #[tokio::test]
    async fn test_reclaim_stale_assignment() {
        let events = Arc::new(CollectingEventSink::new());
        let d = dispatcher(Arc::clone(&events));
        d.register_run(linear_graph(1), HashMap::new()).await.unwrap();
        let a = identify(&d, &[]).await;
        let b = identify(&d, &[]).await;
        let (task_id, _) = poll(&d, &a).await.unwrap();

        assert!(d.reclaim_stale(Duration::from_secs(3600)).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(d.reclaim_stale(Duration::from_millis(1)).await.unwrap(), vec![task_id]);
        assert_eq!(events.count(names::TASK_RECLAIMED), 1);

        assert_eq!(poll(&d, &b).await.unwrap().0, task_id);
        assert!(!d
            .handle_result(a.0, task_id, ResultReport::ok(Vec::new()).with_bytes("out1", b"late".to_vec()))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_function_binaries_are_served_to_workers() {
        let d = dispatcher(Arc::new(CollectingEventSink::new()));
        let worker = identify(&d, &[]).await;

        d.store_function("fn.score", b"v1".to_vec()).await.unwrap();
        d.store_function("fn.score", b"v2".to_vec()).await.unwrap();
        assert_eq!(d.fetch_function(worker.0, &worker.1, "fn.score").await.unwrap(), b"v2");

        assert!(matches!(
            d.fetch_function(worker.0, &worker.1, "fn.missing").await,
            Err(TaskgridError::Storage(ref e)) if e.is_not_found()
        ));
        assert!(matches!(
            d.fetch_function(worker.0, "forged", "fn.score").await,
            Err(TaskgridError::StaleSession(_))
        ));
    }

    #[test]
    fn test_storage_timeout_reaches_variable_service() {
        let d = Dispatcher::new(
            DispatcherConfig::default().with_storage_timeout_secs(7),
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(DatabaseBlobStorage::in_memory().unwrap()),
            Arc::new(CollectingEventSink::new()),
        );
        assert_eq!(d.config().storage_timeout(), Duration::from_secs(7));
        assert!(format!("{:?}", d.variables).contains("timeout: Some(7s)"));
    }

    #[tokio::test]
    async fn test_fetch_variable_and_delete_run() {
        let d = dispatcher(Arc::new(CollectingEventSink::new()));
        let graph = linear_graph(1)
            .with_global("seed")
            .with_process(ProcessDef::new("use_seed", "fn").with_input(VariableDecl::global("seed")));
        let run = d
            .register_run(graph, HashMap::from([("seed".to_string(), b"s33d".to_vec())]))
            .await
            .unwrap();
        let worker = identify(&d, &[]).await;

        let mut seen = None;
        while let Some((_, params)) = poll(&d, &worker).await {
            if let Some(input) = params.input("seed") {
                seen = input.locator.variable_ids().first().copied();
            }
        }
        let variable_id = seen.unwrap();
        assert_eq!(d.fetch_variable(worker.0, &worker.1, variable_id).await.unwrap(), b"s33d");
        assert!(matches!(
            d.fetch_variable(worker.0, "forged", variable_id).await,
            Err(TaskgridError::StaleSession(_))
        ));

        assert_eq!(d.delete_run_tasks(run.run_id).await.unwrap(), 2);
        assert!(d.run_tasks(run.run_id).await.unwrap().is_empty());
        assert!(d.fetch_variable(worker.0, &worker.1, variable_id).await.is_err());
    }
}
