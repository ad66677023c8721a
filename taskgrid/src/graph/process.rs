//! Process definitions: one node of an execution graph.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a function runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FunctionExecContext {
    /// On a processor.
    #[default]
    External,
    /// Inside the dispatcher.
    Internal,
}

/// Where a processor obtains the function binary from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FunctionSourcing {
    /// Installed on the processor already.
    #[default]
    Processor,
    /// Downloaded from the dispatcher before the first execution.
    Dispatcher,
}

/// A reference to an executable function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionRef {
    /// Function code.
    pub code: String,
    /// Optional opaque parameter blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<String>,
    /// Execution context.
    #[serde(default)]
    pub context: FunctionExecContext,
    /// Binary sourcing.
    #[serde(default)]
    pub sourcing: FunctionSourcing,
}

impl FunctionRef {
    /// Creates an external function reference without params.
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            params: None,
            context: FunctionExecContext::External,
            sourcing: FunctionSourcing::Processor,
        }
    }

    /// Marks the binary as hosted by the dispatcher.
    #[must_use]
    pub fn from_dispatcher(mut self) -> Self {
        self.sourcing = FunctionSourcing::Dispatcher;
        self
    }

    /// Sets the parameter blob.
    #[must_use]
    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.params = Some(params.into());
        self
    }

    /// Marks the function as dispatcher-internal.
    #[must_use]
    pub fn internal(mut self) -> Self {
        self.context = FunctionExecContext::Internal;
        self
    }
}

/// Scope of a declared variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VariableContext {
    /// Shared by every process of the run.
    Global,
    /// Produced and consumed within the run.
    #[default]
    Local,
    /// One element per parallel branch of the producer.
    Array,
}

/// Where the bytes of a variable are obtained from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataSourcing {
    /// Stored by the dispatcher.
    #[default]
    Dispatcher,
    /// Local disk of the processor.
    Disk,
    /// A git checkout.
    Git,
}

/// A declared input or output of a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDecl {
    /// Variable name.
    pub name: String,
    /// Scope.
    #[serde(default)]
    pub context: VariableContext,
    /// Sourcing.
    #[serde(default)]
    pub sourcing: DataSourcing,
    /// Whether the variable may be absent.
    #[serde(default)]
    pub nullable: bool,
    /// Free-form type hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_hint: Option<String>,
}

impl VariableDecl {
    /// A local variable.
    #[must_use]
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context: VariableContext::Local,
            sourcing: DataSourcing::Dispatcher,
            nullable: false,
            type_hint: None,
        }
    }

    /// A global variable.
    #[must_use]
    pub fn global(name: impl Into<String>) -> Self {
        Self {
            context: VariableContext::Global,
            ..Self::local(name)
        }
    }

    /// An array variable collecting every branch output.
    #[must_use]
    pub fn array(name: impl Into<String>) -> Self {
        Self {
            context: VariableContext::Array,
            ..Self::local(name)
        }
    }

    /// Marks the variable nullable.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Sets the type hint.
    #[must_use]
    pub fn with_type_hint(mut self, hint: impl Into<String>) -> Self {
        self.type_hint = Some(hint.into());
        self
    }
}

/// Result cache policy of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CachePolicy {
    /// Whether results are cached.
    #[serde(default)]
    pub enabled: bool,
    /// Whether inline values are left out of the fingerprint.
    #[serde(default)]
    pub omit_inline: bool,
}

/// How the branches of a process are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubProcessLogic {
    /// One branch at a time, in declaration order.
    Sequential,
    /// All branches at once.
    Parallel,
}

/// One branch of a process with sub-processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    /// Branch name.
    pub name: String,
    /// Inline values private to the branch.
    #[serde(default)]
    pub inline: BTreeMap<String, String>,
}

impl Branch {
    /// Creates a branch without inline values.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inline: BTreeMap::new(),
        }
    }

    /// Adds an inline value.
    #[must_use]
    pub fn with_inline(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inline.insert(key.into(), value.into());
        self
    }
}

/// Branch declaration of a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubProcesses {
    /// Scheduling logic.
    pub logic: SubProcessLogic,
    /// Branches in declaration order.
    pub branches: Vec<Branch>,
}

/// A concrete execution context of a process: one per branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchContext {
    /// Sub-context id, unique within the process.
    pub sub_context_id: String,
    /// Inline values of the branch.
    pub inline: BTreeMap<String, String>,
}

fn default_context_id() -> String {
    "1".to_string()
}

/// One pipeline step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDef {
    /// Unique code within the graph.
    pub code: String,
    /// Human readable name.
    #[serde(default)]
    pub name: String,
    /// Main function.
    pub function: FunctionRef,
    /// Functions run before the main one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_functions: Vec<FunctionRef>,
    /// Functions run after the main one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_functions: Vec<FunctionRef>,
    /// Optional branches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_processes: Option<SubProcesses>,
    /// Declared inputs.
    #[serde(default)]
    pub inputs: Vec<VariableDecl>,
    /// Declared outputs.
    #[serde(default)]
    pub outputs: Vec<VariableDecl>,
    /// Result cache policy.
    #[serde(default)]
    pub cache: CachePolicy,
    /// Worker tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Scheduling priority; higher first.
    #[serde(default)]
    pub priority: i32,
    /// Boolean gate, see [`crate::graph::Condition`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Execution timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// A failed optional process does not block its branch.
    #[serde(default)]
    pub optional: bool,
    /// Explicit retries allowed after an error.
    #[serde(default)]
    pub tries_after_error: u32,
    /// Inline values visible to the function.
    #[serde(default)]
    pub inline: BTreeMap<String, String>,
    /// Context id prefix for branch sub-contexts.
    #[serde(default = "default_context_id")]
    pub internal_context_id: String,
}

impl ProcessDef {
    /// Creates a process running `function_code` with no inputs.
    #[must_use]
    pub fn new(code: impl Into<String>, function_code: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            name: code.clone(),
            code,
            function: FunctionRef::new(function_code),
            pre_functions: Vec::new(),
            post_functions: Vec::new(),
            sub_processes: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            cache: CachePolicy::default(),
            tag: None,
            priority: 0,
            condition: None,
            timeout_secs: None,
            optional: false,
            tries_after_error: 0,
            inline: BTreeMap::new(),
            internal_context_id: default_context_id(),
        }
    }

    /// Replaces the main function.
    #[must_use]
    pub fn with_function(mut self, function: FunctionRef) -> Self {
        self.function = function;
        self
    }

    /// Adds a pre-function.
    #[must_use]
    pub fn with_pre_function(mut self, function: FunctionRef) -> Self {
        self.pre_functions.push(function);
        self
    }

    /// Adds a post-function.
    #[must_use]
    pub fn with_post_function(mut self, function: FunctionRef) -> Self {
        self.post_functions.push(function);
        self
    }

    /// Adds an input.
    #[must_use]
    pub fn with_input(mut self, input: VariableDecl) -> Self {
        self.inputs.push(input);
        self
    }

    /// Adds an output.
    #[must_use]
    pub fn with_output(mut self, output: VariableDecl) -> Self {
        self.outputs.push(output);
        self
    }

    /// Enables the result cache.
    #[must_use]
    pub fn with_cache(mut self, omit_inline: bool) -> Self {
        self.cache = CachePolicy {
            enabled: true,
            omit_inline,
        };
        self
    }

    /// Sets the worker tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the condition gate.
    #[must_use]
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Marks the process optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Allows explicit retries after an error.
    #[must_use]
    pub fn with_tries_after_error(mut self, tries: u32) -> Self {
        self.tries_after_error = tries;
        self
    }

    /// Adds an inline value.
    #[must_use]
    pub fn with_inline(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inline.insert(key.into(), value.into());
        self
    }

    /// Declares parallel branches.
    #[must_use]
    pub fn parallel(mut self, branches: Vec<Branch>) -> Self {
        self.sub_processes = Some(SubProcesses {
            logic: SubProcessLogic::Parallel,
            branches,
        });
        self
    }

    /// Declares sequential branches.
    #[must_use]
    pub fn sequential(mut self, branches: Vec<Branch>) -> Self {
        self.sub_processes = Some(SubProcesses {
            logic: SubProcessLogic::Sequential,
            branches,
        });
        self
    }

    /// Returns the scheduling logic, `None` for a single-context process.
    #[must_use]
    pub fn logic(&self) -> Option<SubProcessLogic> {
        self.sub_processes
            .as_ref()
            .filter(|s| !s.branches.is_empty())
            .map(|s| s.logic)
    }

    /// Returns the execution contexts of the process in branch order.
    ///
    /// A process without branches has a single context equal to
    /// `internal_context_id`; branch `i` gets `"{internal_context_id},{i+1}"`.
    #[must_use]
    pub fn branch_contexts(&self) -> Vec<BranchContext> {
        match self.sub_processes.as_ref().filter(|s| !s.branches.is_empty()) {
            None => vec![BranchContext {
                sub_context_id: self.internal_context_id.clone(),
                inline: BTreeMap::new(),
            }],
            Some(sub) => sub
                .branches
                .iter()
                .enumerate()
                .map(|(i, branch)| BranchContext {
                    sub_context_id: format!("{},{}", self.internal_context_id, i + 1),
                    inline: branch.inline.clone(),
                })
                .collect(),
        }
    }

    /// Looks up a declared output.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&VariableDecl> {
        self.outputs.iter().find(|o| o.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_single_context() {
        let p = ProcessDef::new("p1", "fn.one");
        let contexts = p.branch_contexts();
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].sub_context_id, "1");
        assert_eq!(p.logic(), None);
    }

    #[test]
    fn test_parallel_contexts_are_distinct() {
        let p = ProcessDef::new("split", "fn.split").parallel(vec![
            Branch::new("a").with_inline("part", "a"),
            Branch::new("b"),
            Branch::new("c"),
        ]);
        let ids: Vec<String> = p.branch_contexts().into_iter().map(|c| c.sub_context_id).collect();
        assert_eq!(ids, vec!["1,1", "1,2", "1,3"]);
        assert_eq!(p.branch_contexts()[0].inline.get("part").map(String::as_str), Some("a"));
        assert_eq!(p.logic(), Some(SubProcessLogic::Parallel));
    }

    #[test]
    fn test_serde_defaults() {
        let yaml = "code: p1\nfunction:\n  code: fn.one\noutputs:\n  - name: out\n";
        let p: ProcessDef = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(p.internal_context_id, "1");
        assert_eq!(p.function.context, FunctionExecContext::External);
        assert_eq!(p.outputs[0].context, VariableContext::Local);
        assert!(!p.cache.enabled);
    }
}
