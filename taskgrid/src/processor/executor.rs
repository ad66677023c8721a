//! Function execution on the processor.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::TaskParams;
use crate::dispatcher::ResultReport;
use crate::errors::ExecutionError;

/// Time budget for tasks whose process declares no timeout.
pub const DEFAULT_FUNCTION_TIMEOUT: Duration = Duration::from_secs(3600);

/// Downloaded value of one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputValue {
    /// Bytes of a variable.
    Bytes(Vec<u8>),
    /// One slot per upstream branch; `None` for a branch that produced no value.
    Array(Vec<Option<Vec<u8>>>),
    /// Inline literal.
    Inline(String),
    /// Nullable input whose producer was skipped.
    Null,
}

/// A named input handed to a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInput {
    /// Declared input name.
    pub name: String,
    /// The value.
    pub value: InputValue,
}

impl FunctionInput {
    /// Creates an input.
    #[must_use]
    pub fn new(name: impl Into<String>, value: InputValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// What a function produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FunctionOutcome {
    /// Exit code; non-zero means failure.
    pub exit_code: i32,
    /// Console output.
    pub console: String,
    /// Outputs by name; `None` marks an output deliberately left empty.
    pub outputs: BTreeMap<String, Option<Vec<u8>>>,
}

impl FunctionOutcome {
    /// A successful outcome without outputs.
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    /// Adds an output.
    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.outputs.insert(name.into(), Some(bytes));
        self
    }

    /// Adds an output that holds no value.
    #[must_use]
    pub fn with_null_output(mut self, name: impl Into<String>) -> Self {
        self.outputs.insert(name.into(), None);
        self
    }

    /// Sets the console text.
    #[must_use]
    pub fn with_console(mut self, console: impl Into<String>) -> Self {
        self.console = console.into();
        self
    }

    /// Converts the outcome into the report sent to the dispatcher.
    ///
    /// Only outputs the task declares are reported. A declared output the
    /// function did not mention is left out; the dispatcher decides whether
    /// that is acceptable.
    #[must_use]
    pub fn into_report(self, params: &TaskParams) -> ResultReport {
        if self.exit_code != 0 {
            return ResultReport::error(self.exit_code, self.console);
        }
        let mut report = ResultReport::ok(Vec::new());
        report.console = self.console;
        let mut outputs = self.outputs;
        for declared in &params.outputs {
            report = match outputs.remove(&declared.name) {
                Some(Some(bytes)) => report.with_bytes(declared.name.clone(), bytes),
                Some(None) => report.with_nullified(declared.name.clone()),
                None => report,
            };
        }
        for extra in outputs.keys() {
            debug!(function = %params.function.code, output = %extra, "undeclared output dropped");
        }
        report
    }
}

/// Runs the function of a task.
#[async_trait]
pub trait FunctionExecutor: Send + Sync {
    /// Executes `params.function` over the downloaded inputs.
    async fn execute(&self, params: &TaskParams, inputs: Vec<FunctionInput>) -> Result<FunctionOutcome, ExecutionError>;

    /// Installs the binary of a dispatcher-sourced function. Called once per
    /// function code, before the first task that uses it runs.
    async fn install(&self, _code: &str, _binary: Vec<u8>) -> Result<(), ExecutionError> {
        Ok(())
    }
}

/// Executes a task under its timeout and turns every outcome into a report.
pub async fn execute_with_timeout(
    executor: &dyn FunctionExecutor,
    params: &TaskParams,
    inputs: Vec<FunctionInput>,
) -> ResultReport {
    let budget = params
        .timeout_secs
        .map_or(DEFAULT_FUNCTION_TIMEOUT, Duration::from_secs);
    match tokio::time::timeout(budget, executor.execute(params, inputs)).await {
        Ok(Ok(outcome)) => outcome.into_report(params),
        Ok(Err(e)) => {
            warn!(function = %e.function, exit_code = e.exit_code, "function failed");
            ResultReport::error(e.exit_code, e.message)
        }
        Err(_) => {
            warn!(function = %params.function.code, budget_secs = budget.as_secs(), "function timed out");
            ResultReport::error(-1, format!("function '{}' timed out after {}s", params.function.code, budget.as_secs()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{OutputPayload, ReportedState};
    use crate::testing::{sample_params, EchoExecutor, FailingExecutor};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_into_report_keeps_declared_outputs() {
        let params = sample_params(&["a", "b", "c"]);
        let report = FunctionOutcome::success()
            .with_output("a", b"1".to_vec())
            .with_null_output("b")
            .with_output("zzz", b"ignored".to_vec())
            .into_report(&params);

        assert_eq!(report.state, ReportedState::Ok);
        assert_eq!(report.output("a"), Some(&OutputPayload::Bytes(b"1".to_vec())));
        assert_eq!(report.output("b"), Some(&OutputPayload::Nullified));
        assert_eq!(report.output("c"), None);
        assert_eq!(report.output("zzz"), None);
    }

    #[test]
    fn test_non_zero_exit_is_an_error_report() {
        let params = sample_params(&["a"]);
        let outcome = FunctionOutcome {
            exit_code: 3,
            console: "bad input".into(),
            outputs: BTreeMap::new(),
        };
        let report = outcome.into_report(&params);
        assert_eq!(report.state, ReportedState::Error);
        assert_eq!(report.exit_code, Some(3));
        assert_eq!(report.console, "bad input");
    }

    #[tokio::test]
    async fn test_execute_with_timeout() {
        let params = sample_params(&["out"]);
        let report = execute_with_timeout(
            &EchoExecutor,
            &params,
            vec![FunctionInput::new("in", InputValue::Bytes(b"hi".to_vec()))],
        )
        .await;
        assert_eq!(report.output("out"), Some(&OutputPayload::Bytes(b"hi".to_vec())));

        let report = execute_with_timeout(&FailingExecutor::new("boom"), &params, Vec::new()).await;
        assert_eq!(report.state, ReportedState::Error);
        assert!(report.console.contains("boom"));
    }

    #[tokio::test]
    async fn test_timeout_becomes_error() {
        let mut params = sample_params(&["out"]);
        params.timeout_secs = Some(1);
        let slow = crate::testing::SlowExecutor::new(Duration::from_secs(5));
        let report = execute_with_timeout(&slow, &params, Vec::new()).await;
        assert_eq!(report.exit_code, Some(-1));
        assert!(report.console.contains("timed out"));
    }
}
