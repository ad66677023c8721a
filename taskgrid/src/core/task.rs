//! Task records and the parameter blob handed to workers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{RunId, TaskExecState, TaskId, VariableId, WorkerId};
use crate::graph::FunctionRef;
use crate::utils::Timestamp;

/// Where a worker finds the bytes of one input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputLocator {
    /// Output variable of an upstream task.
    Variable {
        /// The variable to download.
        variable_id: VariableId,
    },
    /// Run-level global variable.
    Global {
        /// The variable to download.
        variable_id: VariableId,
    },
    /// Outputs of every branch of an upstream parallel process, in branch order.
    Array {
        /// The variables to download.
        variable_ids: Vec<VariableId>,
    },
    /// Literal value carried in the blob.
    Inline {
        /// The literal.
        value: String,
    },
    /// A nullable input whose producer was skipped.
    Null,
}

impl InputLocator {
    /// Returns every variable this locator references.
    #[must_use]
    pub fn variable_ids(&self) -> Vec<VariableId> {
        match self {
            Self::Variable { variable_id } | Self::Global { variable_id } => vec![*variable_id],
            Self::Array { variable_ids } => variable_ids.clone(),
            Self::Inline { .. } | Self::Null => Vec::new(),
        }
    }
}

/// A resolved input binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInput {
    /// Declared input name.
    pub name: String,
    /// Resolved location.
    pub locator: InputLocator,
}

/// An output placeholder the worker must fill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Declared output name.
    pub name: String,
    /// Placeholder variable created at production time.
    pub variable_id: VariableId,
    /// Whether the worker may report this output as absent.
    #[serde(default)]
    pub nullable: bool,
}

/// The immutable parameter blob of a task.
///
/// Built once by the producer and parsed once at the processor boundary;
/// never re-parsed lazily.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskParams {
    /// Owning run.
    pub run_id: RunId,
    /// Graph node.
    pub process_code: String,
    /// Branch context within the node.
    pub sub_context_id: String,
    /// Function to execute.
    pub function: FunctionRef,
    /// Functions executed before the main one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_functions: Vec<FunctionRef>,
    /// Functions executed after the main one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_functions: Vec<FunctionRef>,
    /// Resolved inputs in declaration order.
    #[serde(default)]
    pub inputs: Vec<TaskInput>,
    /// Output placeholders in declaration order.
    #[serde(default)]
    pub outputs: Vec<TaskOutput>,
    /// Inline values visible to the function.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inline: BTreeMap<String, String>,
    /// Execution timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl TaskParams {
    /// Encodes the blob for the wire.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses a blob received from the wire.
    pub fn from_wire(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Looks up an output placeholder by name.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&TaskOutput> {
        self.outputs.iter().find(|o| o.name == name)
    }

    /// Looks up an input binding by name.
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&TaskInput> {
        self.inputs.iter().find(|i| i.name == name)
    }
}

/// Result and metrics recorded when a task finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaskResult {
    /// Exit code reported by the worker, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Console output or error text.
    #[serde(default)]
    pub console: String,
    /// True when outputs were copied from the result cache.
    #[serde(default)]
    pub from_cache: bool,
}

impl TaskResult {
    /// A result synthesized from a cache hit.
    #[must_use]
    pub fn cached() -> Self {
        Self {
            exit_code: Some(0),
            console: String::new(),
            from_cache: true,
        }
    }

    /// A result describing a dispatcher-side failure.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            console: message.into(),
            from_cache: false,
        }
    }
}

/// The uniqueness key of a task within the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    /// Owning run.
    pub run_id: RunId,
    /// Graph node.
    pub process_code: String,
    /// Branch context.
    pub sub_context_id: String,
}

/// A task about to be inserted. The store assigns the id.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Parameter blob.
    pub params: TaskParams,
    /// Initial state, `NONE` or `SKIPPED`.
    pub state: TaskExecState,
    /// Scheduling priority; higher first.
    pub priority: i32,
    /// Position of the node in the graph's topological order.
    pub topo_index: usize,
    /// Worker tag required to receive this task.
    pub tag: Option<String>,
    /// Cache fingerprint when the process is cacheable.
    pub cache_fingerprint: Option<String>,
}

/// One unit of work bound to one graph node of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Task id.
    pub id: TaskId,
    /// Parameter blob.
    pub params: TaskParams,
    /// Current state.
    pub exec_state: TaskExecState,
    /// Scheduling priority; higher first.
    pub priority: i32,
    /// Position of the node in topological order.
    pub topo_index: usize,
    /// Worker tag required to receive this task.
    pub tag: Option<String>,
    /// Worker currently holding the task.
    pub assigned_worker: Option<WorkerId>,
    /// When the task was handed out.
    pub assigned_on: Option<Timestamp>,
    /// When the task reached a terminal state.
    pub completed_on: Option<Timestamp>,
    /// True once a worker reported a result.
    pub result_received: bool,
    /// Recorded result.
    pub result: Option<TaskResult>,
    /// Cache fingerprint when the process is cacheable.
    pub cache_fingerprint: Option<String>,
    /// Creation time.
    pub created_on: Timestamp,
}

impl Task {
    /// Materializes a new task record.
    #[must_use]
    pub fn from_new(id: TaskId, new: NewTask, now: Timestamp) -> Self {
        let completed_on = new.state.is_terminal().then_some(now);
        Self {
            id,
            params: new.params,
            exec_state: new.state,
            priority: new.priority,
            topo_index: new.topo_index,
            tag: new.tag,
            assigned_worker: None,
            assigned_on: None,
            completed_on,
            result_received: false,
            result: None,
            cache_fingerprint: new.cache_fingerprint,
            created_on: now,
        }
    }

    /// Owning run.
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.params.run_id
    }

    /// Graph node.
    #[must_use]
    pub fn process_code(&self) -> &str {
        &self.params.process_code
    }

    /// Branch context.
    #[must_use]
    pub fn sub_context_id(&self) -> &str {
        &self.params.sub_context_id
    }

    /// The uniqueness key.
    #[must_use]
    pub fn key(&self) -> TaskKey {
        TaskKey {
            run_id: self.params.run_id,
            process_code: self.params.process_code.clone(),
            sub_context_id: self.params.sub_context_id.clone(),
        }
    }

    /// True if a worker with `tags` may receive this task.
    #[must_use]
    pub fn tag_allowed(&self, tags: &[String]) -> bool {
        match self.tag.as_deref() {
            None | Some("") => true,
            Some(tag) => tags.iter().any(|t| t == tag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params() -> TaskParams {
        TaskParams {
            run_id: RunId::new(1),
            process_code: "extract".into(),
            sub_context_id: "1".into(),
            function: FunctionRef::new("fn.extract"),
            pre_functions: Vec::new(),
            post_functions: Vec::new(),
            inputs: vec![
                TaskInput {
                    name: "source".into(),
                    locator: InputLocator::Global {
                        variable_id: VariableId::new(5),
                    },
                },
                TaskInput {
                    name: "mode".into(),
                    locator: InputLocator::Inline { value: "fast".into() },
                },
            ],
            outputs: vec![TaskOutput {
                name: "rows".into(),
                variable_id: VariableId::new(9),
                nullable: false,
            }],
            inline: BTreeMap::new(),
            timeout_secs: Some(30),
        }
    }

    #[test]
    fn test_params_wire_is_lossless() {
        let p = params();
        let text = p.to_wire().unwrap();
        assert!(text.contains("\"kind\":\"global\""));
        assert_eq!(TaskParams::from_wire(&text).unwrap(), p);
    }

    #[test]
    fn test_lookup_helpers() {
        let p = params();
        assert_eq!(p.output("rows").map(|o| o.variable_id), Some(VariableId::new(9)));
        assert!(p.output("missing").is_none());
        assert_eq!(
            p.input("source").map(|i| i.locator.variable_ids()),
            Some(vec![VariableId::new(5)])
        );
    }

    #[test]
    fn test_tag_filter() {
        let mut task = Task::from_new(
            TaskId::new(1),
            NewTask {
                params: params(),
                state: TaskExecState::None,
                priority: 0,
                topo_index: 0,
                tag: None,
                cache_fingerprint: None,
            },
            chrono::Utc::now(),
        );
        assert!(task.tag_allowed(&[]));

        task.tag = Some("gpu".into());
        assert!(!task.tag_allowed(&["cpu".to_string()]));
        assert!(task.tag_allowed(&["cpu".to_string(), "gpu".to_string()]));
    }
}
