//! Per-endpoint conversation state of a processor.
//!
//! Each dispatcher endpoint gets one [`DispatcherRequestor`]. It remembers
//! the identity the dispatcher issued, the tasks received from it and the
//! results not yet delivered. Every request tick sends exactly one envelope.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::client::{is_not_found, DispatcherClient};
use super::endpoint::DispatcherEndpoint;
use super::executor::{execute_with_timeout, FunctionExecutor, FunctionInput, InputValue, DEFAULT_FUNCTION_TIMEOUT};
use super::schedule::Schedule;
use crate::core::{InputLocator, TaskId, TaskParams, WorkerId};
use crate::dispatcher::{Assignment, RequestBody, RequestEnvelope, ResponseBody, ResultReport, WorkerStatus};
use crate::errors::{ConfigError, TransportError};
use crate::graph::FunctionSourcing;

/// Extra time granted past a task's own timeout before the cleanup loop
/// abandons it.
pub const ABANDON_GRACE: Duration = Duration::from_secs(60);

/// What one request tick achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A new identity was issued.
    Identified(WorkerId),
    /// A task was received.
    Assigned(TaskId),
    /// A pending result was delivered.
    Reported {
        /// The task.
        task_id: TaskId,
        /// False if the dispatcher rejected it.
        accepted: bool,
    },
    /// A status report was acknowledged.
    StatusReported,
    /// The dispatcher asked for a new identity.
    ReIdentify,
    /// Nothing happened.
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Received,
    Running { deadline: Instant },
}

#[derive(Debug)]
struct ActiveTask {
    task_id: TaskId,
    params: Arc<TaskParams>,
    phase: Phase,
    abort: Option<tokio::task::AbortHandle>,
}

#[derive(Debug, Default)]
struct State {
    identity: Option<(WorkerId, String)>,
    active: Vec<ActiveTask>,
    pending: VecDeque<(TaskId, ResultReport)>,
    installed: HashSet<String>,
}

/// Which command a tick sent, to interpret the answer.
#[derive(Debug, Clone, Copy)]
enum Sent {
    Identify,
    Report(TaskId),
    Poll,
    Status,
}

/// Conversation with one dispatcher endpoint.
pub struct DispatcherRequestor {
    endpoint: DispatcherEndpoint,
    schedule: Schedule,
    tags: Vec<String>,
    client: Arc<dyn DispatcherClient>,
    state: Mutex<State>,
}

impl std::fmt::Debug for DispatcherRequestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherRequestor")
            .field("endpoint", &self.endpoint.url)
            .field("schedule", &self.schedule)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl DispatcherRequestor {
    /// Creates a requestor. Fails if the endpoint's schedule is malformed.
    pub fn new(
        endpoint: DispatcherEndpoint,
        tags: Vec<String>,
        client: Arc<dyn DispatcherClient>,
    ) -> Result<Self, ConfigError> {
        let schedule = endpoint.parsed_schedule()?;
        Ok(Self {
            endpoint,
            schedule,
            tags,
            client,
            state: Mutex::new(State::default()),
        })
    }

    /// The endpoint this requestor talks to.
    #[must_use]
    pub fn endpoint(&self) -> &DispatcherEndpoint {
        &self.endpoint
    }

    /// The identity issued by the dispatcher, if any.
    #[must_use]
    pub fn identity(&self) -> Option<(WorkerId, String)> {
        self.state.lock().identity.clone()
    }

    /// Number of received or running tasks.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Number of results waiting to be delivered.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn next_request(&self) -> (Sent, RequestEnvelope) {
        let state = self.state.lock();
        let Some((worker_id, ref session_id)) = state.identity else {
            let body = RequestBody::Identify { tags: self.tags.clone() };
            return (Sent::Identify, RequestEnvelope::anonymous(body));
        };
        let (sent, body) = if let Some((task_id, report)) = state.pending.front() {
            (
                Sent::Report(*task_id),
                RequestBody::ReportResult {
                    task_id: *task_id,
                    result: report.clone(),
                },
            )
        } else if state.active.is_empty() && self.schedule.is_active_now() {
            (Sent::Poll, RequestBody::Poll)
        } else {
            let mut task_ids: Vec<TaskId> = state.active.iter().map(|t| t.task_id).collect();
            task_ids.extend(state.pending.iter().map(|(id, _)| *id));
            (
                Sent::Status,
                RequestBody::ReportStatus {
                    status: WorkerStatus {
                        tags: self.tags.clone(),
                        task_ids,
                    },
                },
            )
        };
        (sent, RequestEnvelope::from_worker(worker_id, session_id.clone(), body))
    }

    /// Sends one envelope and applies the answer.
    ///
    /// Transport failures leave the state untouched; the caller logs them
    /// and the next tick tries again.
    pub async fn tick(&self) -> Result<TickOutcome, TransportError> {
        let (sent, request) = self.next_request();
        let response = self.client.exchange(&self.endpoint, request).await?;
        Ok(self.apply(sent, response))
    }

    fn apply(&self, sent: Sent, response: ResponseBody) -> TickOutcome {
        let mut state = self.state.lock();
        match response {
            ResponseBody::ReIdentify => {
                info!(endpoint = %self.endpoint.url, "dispatcher requested re-identification");
                state.identity = None;
                TickOutcome::ReIdentify
            }
            ResponseBody::Identity { worker_id, session_id } => {
                info!(endpoint = %self.endpoint.url, worker_id = %worker_id, "identified");
                state.identity = Some((worker_id, session_id));
                TickOutcome::Identified(worker_id)
            }
            ResponseBody::Task(Assignment { task_id, params }) => match TaskParams::from_wire(&params) {
                Ok(params) => {
                    info!(endpoint = %self.endpoint.url, task_id = %task_id, process = %params.process_code, "task received");
                    state.active.push(ActiveTask {
                        task_id,
                        params: Arc::new(params),
                        phase: Phase::Received,
                        abort: None,
                    });
                    TickOutcome::Assigned(task_id)
                }
                Err(e) => {
                    warn!(endpoint = %self.endpoint.url, task_id = %task_id, error = %e, "unreadable task params");
                    state
                        .pending
                        .push_back((task_id, ResultReport::error(-1, format!("unreadable task params: {e}"))));
                    TickOutcome::Assigned(task_id)
                }
            },
            ResponseBody::Ack { accepted } => match sent {
                Sent::Report(task_id) => {
                    if state.pending.front().is_some_and(|(id, _)| *id == task_id) {
                        state.pending.pop_front();
                    }
                    if accepted {
                        debug!(endpoint = %self.endpoint.url, task_id = %task_id, "result delivered");
                    } else {
                        warn!(endpoint = %self.endpoint.url, task_id = %task_id, "result rejected by dispatcher");
                    }
                    TickOutcome::Reported { task_id, accepted }
                }
                Sent::Status => TickOutcome::StatusReported,
                Sent::Identify | Sent::Poll => TickOutcome::Idle,
            },
            ResponseBody::Empty => TickOutcome::Idle,
        }
    }

    /// Moves received tasks into the running phase and returns them.
    fn take_received(&self) -> Vec<(TaskId, Arc<TaskParams>)> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state
            .active
            .iter_mut()
            .filter(|t| t.phase == Phase::Received)
            .map(|t| {
                let budget = t
                    .params
                    .timeout_secs
                    .map_or(DEFAULT_FUNCTION_TIMEOUT, Duration::from_secs);
                t.phase = Phase::Running {
                    deadline: now + budget + ABANDON_GRACE,
                };
                (t.task_id, Arc::clone(&t.params))
            })
            .collect()
    }

    fn set_abort(&self, task_id: TaskId, handle: tokio::task::AbortHandle) {
        if let Some(task) = self.state.lock().active.iter_mut().find(|t| t.task_id == task_id) {
            task.abort = Some(handle);
        }
    }

    /// Records a result for delivery and forgets the running task.
    fn finish(&self, task_id: TaskId, report: ResultReport) {
        let mut state = self.state.lock();
        let before = state.active.len();
        state.active.retain(|t| t.task_id != task_id);
        if state.active.len() < before {
            state.pending.push_back((task_id, report));
        }
    }

    /// Returns a running task to the received phase for another attempt.
    fn requeue(&self, task_id: TaskId) {
        if let Some(task) = self.state.lock().active.iter_mut().find(|t| t.task_id == task_id) {
            task.phase = Phase::Received;
            task.abort = None;
        }
    }

    /// Starts execution of every received task. Returns how many started.
    pub fn start_received(self: &Arc<Self>, executor: &Arc<dyn FunctionExecutor>) -> usize {
        let received = self.take_received();
        let started = received.len();
        for (task_id, params) in received {
            let requestor = Arc::clone(self);
            let executor = Arc::clone(executor);
            let handle = tokio::spawn(async move {
                match requestor.install_functions(&params, executor.as_ref()).await {
                    Ok(true) => {}
                    Ok(false) => return requestor.requeue(task_id),
                    Err(report) => return requestor.finish(task_id, report),
                }
                match requestor.download_inputs(&params).await {
                    Ok(Some(inputs)) => {
                        let report = execute_with_timeout(executor.as_ref(), &params, inputs).await;
                        requestor.finish(task_id, report);
                    }
                    Ok(None) => requestor.requeue(task_id),
                    Err(report) => requestor.finish(task_id, report),
                }
            });
            self.set_abort(task_id, handle.abort_handle());
        }
        started
    }

    /// Downloads and installs the dispatcher-sourced functions of a task
    /// not yet installed from this endpoint.
    ///
    /// `Ok(false)` means a transient failure; the task is tried again later.
    /// `Err` carries an error report for a function that does not exist or
    /// cannot be installed.
    async fn install_functions(&self, params: &TaskParams, executor: &dyn FunctionExecutor) -> Result<bool, ResultReport> {
        let Some((worker_id, session_id)) = self.identity() else {
            return Ok(false);
        };
        let hosted = params
            .pre_functions
            .iter()
            .chain(std::iter::once(&params.function))
            .chain(&params.post_functions)
            .filter(|f| f.sourcing == FunctionSourcing::Dispatcher);
        for function in hosted {
            if self.state.lock().installed.contains(&function.code) {
                continue;
            }
            match self
                .client
                .download_function(&self.endpoint, worker_id, &session_id, &function.code)
                .await
            {
                Ok(binary) => {
                    let size = binary.len();
                    if let Err(e) = executor.install(&function.code, binary).await {
                        return Err(ResultReport::error(
                            e.exit_code,
                            format!("function '{}' cannot be installed: {}", function.code, e.message),
                        ));
                    }
                    info!(endpoint = %self.endpoint.url, function = %function.code, size, "function installed");
                    self.state.lock().installed.insert(function.code.clone());
                }
                Err(e) if is_not_found(&e) => {
                    return Err(ResultReport::error(-1, format!("function '{}' is not available: {e}", function.code)));
                }
                Err(e) => {
                    warn!(endpoint = %self.endpoint.url, function = %function.code, error = %e, "function download failed");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Downloads every input of a task.
    ///
    /// `Ok(None)` means a transient failure; the task is tried again later.
    /// `Err` carries an error report for inputs that do not exist.
    async fn download_inputs(&self, params: &TaskParams) -> Result<Option<Vec<FunctionInput>>, ResultReport> {
        let Some((worker_id, session_id)) = self.identity() else {
            return Ok(None);
        };
        let mut inputs = Vec::with_capacity(params.inputs.len());
        for input in &params.inputs {
            let value = match input.locator {
                InputLocator::Variable { variable_id } | InputLocator::Global { variable_id } => {
                    match self.client.download(&self.endpoint, worker_id, &session_id, variable_id).await {
                        Ok(bytes) => InputValue::Bytes(bytes),
                        Err(e) if is_not_found(&e) => {
                            return Err(ResultReport::error(-1, format!("input '{}' is not available: {e}", input.name)));
                        }
                        Err(e) => {
                            warn!(endpoint = %self.endpoint.url, variable_id = %variable_id, error = %e, "input download failed");
                            return Ok(None);
                        }
                    }
                }
                InputLocator::Array { ref variable_ids } => {
                    let mut slots = Vec::with_capacity(variable_ids.len());
                    for &variable_id in variable_ids {
                        match self.client.download(&self.endpoint, worker_id, &session_id, variable_id).await {
                            Ok(bytes) => slots.push(Some(bytes)),
                            Err(e) if is_not_found(&e) => slots.push(None),
                            Err(e) => {
                                warn!(endpoint = %self.endpoint.url, variable_id = %variable_id, error = %e, "input download failed");
                                return Ok(None);
                            }
                        }
                    }
                    InputValue::Array(slots)
                }
                InputLocator::Inline { ref value } => InputValue::Inline(value.clone()),
                InputLocator::Null => InputValue::Null,
            };
            inputs.push(FunctionInput::new(input.name.clone(), value));
        }
        Ok(Some(inputs))
    }

    /// Abandons running tasks past their deadline. Returns how many.
    ///
    /// Abandoned tasks are reported as errors.
    pub fn abandon_overdue(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        let (overdue, keep): (Vec<ActiveTask>, Vec<ActiveTask>) = std::mem::take(&mut state.active)
            .into_iter()
            .partition(|t| matches!(t.phase, Phase::Running { deadline } if deadline <= now));
        state.active = keep;
        for task in &overdue {
            if let Some(ref handle) = task.abort {
                handle.abort();
            }
            warn!(endpoint = %self.endpoint.url, task_id = %task.task_id, "execution abandoned");
            state
                .pending
                .push_back((task.task_id, ResultReport::error(-1, "execution abandoned by processor")));
        }
        overdue.len()
    }
}
