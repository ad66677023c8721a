//! Error types for the taskgrid engine.
//!
//! Each concern owns a `thiserror` enum; [`TaskgridError`] aggregates them
//! for callers that cross module boundaries. Every error answers
//! `is_retryable()` so loops can decide between "try again next tick" and
//! "give up".

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::core::{RunId, TaskExecState, TaskId, VariableId, WorkerId};

/// The main error type for taskgrid operations.
#[derive(Debug, Error)]
pub enum TaskgridError {
    /// The execution graph is malformed.
    #[error("{0}")]
    Graph(#[from] GraphError),

    /// The task store refused an operation.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// A storage backend failed.
    #[error("{0}")]
    Storage(#[from] StorageError),

    /// Configuration could not be loaded or is inconsistent.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A network exchange with a dispatcher failed.
    #[error("{0}")]
    Transport(#[from] TransportError),

    /// A function failed on the processor.
    #[error("{0}")]
    Execution(#[from] ExecutionError),

    /// The referenced run is not registered.
    #[error("unknown run {0}")]
    UnknownRun(RunId),

    /// The run was marked invalid and accepts no further work.
    #[error("run {run_id} is invalid: {reason}")]
    InvalidRun {
        /// The rejected run.
        run_id: RunId,
        /// The first blocking error.
        reason: String,
    },

    /// The worker's session is unknown or expired; it must identify again.
    #[error("worker {0} must identify again")]
    StaleSession(WorkerId),

    /// The process allows no further retries of the task.
    #[error("task {task_id} cannot be retried: {attempts} failed attempts, {allowed} retries allowed")]
    RetryExhausted {
        /// The failed task.
        task_id: TaskId,
        /// Failed attempts so far.
        attempts: u32,
        /// The process's retry budget.
        allowed: u32,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl TaskgridError {
    /// Returns true if repeating the operation later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_retryable(),
            Self::Transport(e) => e.is_retryable(),
            Self::Store(e) => e.is_retryable(),
            Self::Graph(_)
            | Self::Config(_)
            | Self::Execution(_)
            | Self::UnknownRun(_)
            | Self::InvalidRun { .. }
            | Self::StaleSession(_)
            | Self::RetryExhausted { .. }
            | Self::Serialization(_) => false,
        }
    }
}

impl From<serde_json::Error> for TaskgridError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Metadata about a graph integrity error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "GRAPH-001-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Converts to a JSON object.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("code".to_string(), self.code.clone().into());
        map.insert("summary".to_string(), self.summary.clone().into());
        if let Some(ref hint) = self.fix_hint {
            map.insert("fix_hint".to_string(), hint.clone().into());
        }
        if !self.context.is_empty() {
            let context: serde_json::Map<String, serde_json::Value> = self
                .context
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect();
            map.insert("context".to_string(), serde_json::Value::Object(context));
        }
        serde_json::Value::Object(map)
    }
}

/// Graph integrity errors. Fatal for the run they belong to.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// The adjacency structure contains a cycle.
    #[error("cycle detected: {}", path.join(" -> "))]
    Cycle {
        /// The process codes forming the cycle, first repeated at the end.
        path: Vec<String>,
    },

    /// An edge or lookup references a process that is not declared.
    #[error("unknown process '{0}'")]
    UnknownProcess(String),

    /// An input cannot be bound to any upstream output, global or inline value.
    #[error("input '{input}' of process '{process}' cannot be resolved")]
    UnresolvableInput {
        /// The consuming process.
        process: String,
        /// The unresolved input name.
        input: String,
    },

    /// Two processes share the same code.
    #[error("duplicate process code '{0}'")]
    DuplicateProcess(String),

    /// A process without inputs has incoming edges.
    #[error("process '{0}' declares no inputs but is not a graph root")]
    InvalidRoot(String),

    /// The serialized graph could not be decoded or migrated.
    #[error("graph schema error: {0}")]
    Schema(String),

    /// A required input is bound to a global the run did not supply.
    #[error("global '{input}' required by process '{process}' was not supplied")]
    MissingGlobal {
        /// The consuming process.
        process: String,
        /// The global name.
        input: String,
    },

    /// A required input's upstream finished without a usable value.
    #[error("input '{input}' of process '{process}' has no value from '{upstream}'")]
    MissingUpstreamValue {
        /// The consuming process.
        process: String,
        /// The input name.
        input: String,
        /// The process expected to produce it.
        upstream: String,
    },
}

impl GraphError {
    /// Returns the structured diagnostic for this error.
    #[must_use]
    pub fn error_info(&self) -> ContractErrorInfo {
        match self {
            Self::Cycle { path } => {
                ContractErrorInfo::new("GRAPH-001-CYCLE", "The process graph contains a cycle")
                    .with_fix_hint("Remove one of the edges listed in the cycle path.")
                    .with_context_entry("cycle_path", path.join(" -> "))
            }
            Self::UnknownProcess(code) => {
                ContractErrorInfo::new("GRAPH-002-UNKNOWN_PROCESS", format!("Process '{code}' is not declared"))
                    .with_fix_hint("Declare the process or fix the edge endpoint.")
                    .with_context_entry("process", code.clone())
            }
            Self::UnresolvableInput { process, input } => ContractErrorInfo::new(
                "GRAPH-003-UNRESOLVABLE_INPUT",
                format!("Input '{input}' has no producer"),
            )
            .with_fix_hint("Add an upstream process that outputs this variable, declare it as a global, or supply an inline value.")
            .with_context_entry("process", process.clone())
            .with_context_entry("input", input.clone()),
            Self::DuplicateProcess(code) => ContractErrorInfo::new(
                "GRAPH-004-DUPLICATE_PROCESS",
                format!("Process code '{code}' is used more than once"),
            )
            .with_fix_hint("Give every process a unique code."),
            Self::InvalidRoot(code) => ContractErrorInfo::new(
                "GRAPH-005-INVALID_ROOT",
                format!("Process '{code}' has no inputs but depends on other processes"),
            )
            .with_fix_hint("Declare the inputs the process consumes or remove its incoming edges."),
            Self::Schema(msg) => ContractErrorInfo::new("GRAPH-006-SCHEMA", msg.clone())
                .with_fix_hint("Check the document version and field names."),
            Self::MissingGlobal { process, input } => ContractErrorInfo::new(
                "GRAPH-007-MISSING_GLOBAL",
                format!("Global '{input}' was not supplied"),
            )
            .with_fix_hint("Pass the global when registering the run or declare the input nullable.")
            .with_context_entry("process", process.clone())
            .with_context_entry("input", input.clone()),
            Self::MissingUpstreamValue {
                process,
                input,
                upstream,
            } => ContractErrorInfo::new(
                "GRAPH-008-MISSING_UPSTREAM_VALUE",
                format!("Process '{upstream}' finished without a value for '{input}'"),
            )
            .with_fix_hint("Make the upstream output non-nullable or declare the input nullable.")
            .with_context_entry("process", process.clone())
            .with_context_entry("input", input.clone())
            .with_context_entry("upstream", upstream.clone()),
        }
    }
}

/// Task store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A non-terminal or successful task already exists for the triple.
    #[error("task already exists for run {run_id}, process '{process_code}', context '{sub_context_id}'")]
    DuplicateTask {
        /// The run.
        run_id: RunId,
        /// The process code.
        process_code: String,
        /// The sub-context id.
        sub_context_id: String,
    },

    /// No task with this id.
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    /// The state machine forbids this transition.
    #[error("task {task_id} cannot move from {from} to {to}")]
    IllegalTransition {
        /// The task.
        task_id: TaskId,
        /// Current state.
        from: TaskExecState,
        /// Requested state.
        to: TaskExecState,
    },

    /// A compare-and-set lost against a concurrent writer.
    #[error("task {0} was modified concurrently")]
    Conflict(TaskId),
}

impl StoreError {
    /// Returns true if repeating the operation later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Storage backend errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The data was never produced. Permanent.
    #[error("data not found: {0}")]
    DataNotFound(String),

    /// The backend is temporarily unreachable. Retryable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Another writer is filling this variable right now.
    #[error("variable {0} is being written by another writer")]
    VariableBusy(VariableId),

    /// The variable already holds data and is immutable.
    #[error("variable {0} is already initialized")]
    AlreadyInited(VariableId),

    /// A local I/O error.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Returns true if repeating the operation later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::VariableBusy(_) | Self::Io(_))
    }

    /// Returns true if the data is permanently missing.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::DataNotFound(_))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Configuration errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No enabled dispatcher endpoint is configured.
    #[error("no enabled dispatcher endpoints are configured")]
    NoEndpoints,

    /// A schedule window string is malformed.
    #[error("invalid schedule '{input}': {reason}")]
    InvalidSchedule {
        /// The offending text.
        input: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The configuration file could not be read.
    #[error("cannot read config {path}: {source}")]
    Read {
        /// The file path.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be parsed.
    #[error("cannot parse config {path}: {reason}")]
    Parse {
        /// The file path.
        path: String,
        /// The parser message.
        reason: String,
    },

    /// A value is out of range or inconsistent.
    #[error("invalid config value '{field}': {reason}")]
    Invalid {
        /// The field name.
        field: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Network errors between processor and dispatcher. Always transient.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request could not be sent or no response arrived.
    #[error("request to {endpoint} failed: {reason}")]
    Network {
        /// The endpoint url.
        endpoint: String,
        /// The failure message.
        reason: String,
    },

    /// The request exceeded its timeout.
    #[error("request to {0} timed out")]
    Timeout(String),

    /// The dispatcher answered with a non-success status.
    #[error("dispatcher {endpoint} returned HTTP {status}")]
    Status {
        /// The endpoint url.
        endpoint: String,
        /// The status code.
        status: u16,
    },

    /// The envelope could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl TransportError {
    /// Transport failures end a tick; the next tick retries elsewhere.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// A function failure reported by an executor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("function '{function}' failed with exit code {exit_code}: {message}")]
pub struct ExecutionError {
    /// The function code.
    pub function: String,
    /// The process exit code or -1.
    pub exit_code: i32,
    /// Console output or exception text.
    pub message: String,
}

impl ExecutionError {
    /// Creates a new execution error.
    #[must_use]
    pub fn new(function: impl Into<String>, exit_code: i32, message: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            exit_code,
            message: message.into(),
        }
    }
}

/// Result alias for taskgrid operations.
pub type Result<T> = std::result::Result<T, TaskgridError>;
