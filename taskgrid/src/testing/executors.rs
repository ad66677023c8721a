//! Function executors with scripted behavior.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::TaskParams;
use crate::errors::ExecutionError;
use crate::processor::{FunctionExecutor, FunctionInput, FunctionOutcome, InputValue};

/// Copies its first input to every declared output.
///
/// Bytes are copied as-is, inline values as UTF-8, arrays are concatenated
/// with empty slots skipped. Without inputs the process code is written.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutor;

fn echo_payload(params: &TaskParams, inputs: &[FunctionInput]) -> Vec<u8> {
    match inputs.first().map(|i| &i.value) {
        Some(InputValue::Bytes(bytes)) => bytes.clone(),
        Some(InputValue::Inline(value)) => value.as_bytes().to_vec(),
        Some(InputValue::Array(slots)) => slots.iter().flatten().flatten().copied().collect(),
        Some(InputValue::Null) => Vec::new(),
        None => params.process_code.as_bytes().to_vec(),
    }
}

#[async_trait]
impl FunctionExecutor for EchoExecutor {
    async fn execute(&self, params: &TaskParams, inputs: Vec<FunctionInput>) -> Result<FunctionOutcome, ExecutionError> {
        let payload = echo_payload(params, &inputs);
        Ok(params
            .outputs
            .iter()
            .fold(FunctionOutcome::success(), |outcome, output| {
                outcome.with_output(output.name.clone(), payload.clone())
            }))
    }
}

/// Always fails with the configured message.
#[derive(Debug, Clone)]
pub struct FailingExecutor {
    message: String,
    exit_code: i32,
}

impl FailingExecutor {
    /// Creates an executor that fails with exit code 1.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: 1,
        }
    }

    /// Sets the exit code.
    #[must_use]
    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }
}

#[async_trait]
impl FunctionExecutor for FailingExecutor {
    async fn execute(&self, params: &TaskParams, _inputs: Vec<FunctionInput>) -> Result<FunctionOutcome, ExecutionError> {
        Err(ExecutionError::new(params.function.code.clone(), self.exit_code, self.message.clone()))
    }
}

/// Echoes like [`EchoExecutor`] and records every call and install.
///
/// Processes listed with [`CountingExecutor::failing_on`] fail instead.
#[derive(Debug, Default)]
pub struct CountingExecutor {
    calls: AtomicUsize,
    processes: Mutex<Vec<String>>,
    installed: Mutex<Vec<(String, Vec<u8>)>>,
    failing: Vec<String>,
}

impl CountingExecutor {
    /// Creates a counting executor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes calls for `process_code` fail.
    #[must_use]
    pub fn failing_on(mut self, process_code: impl Into<String>) -> Self {
        self.failing.push(process_code.into());
        self
    }

    /// Number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Process codes of every call, in call order.
    #[must_use]
    pub fn processes(&self) -> Vec<String> {
        self.processes.lock().clone()
    }

    /// Function binaries installed so far, in install order.
    #[must_use]
    pub fn installed(&self) -> Vec<(String, Vec<u8>)> {
        self.installed.lock().clone()
    }
}

#[async_trait]
impl FunctionExecutor for CountingExecutor {
    async fn execute(&self, params: &TaskParams, inputs: Vec<FunctionInput>) -> Result<FunctionOutcome, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.processes.lock().push(params.process_code.clone());
        if self.failing.contains(&params.process_code) {
            return Err(ExecutionError::new(params.function.code.clone(), 1, "scripted failure"));
        }
        EchoExecutor.execute(params, inputs).await
    }

    async fn install(&self, code: &str, binary: Vec<u8>) -> Result<(), ExecutionError> {
        self.installed.lock().push((code.to_string(), binary));
        Ok(())
    }
}

/// Sleeps before echoing.
#[derive(Debug, Clone, Copy)]
pub struct SlowExecutor {
    delay: Duration,
}

impl SlowExecutor {
    /// Creates an executor that sleeps for `delay`.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl FunctionExecutor for SlowExecutor {
    async fn execute(&self, params: &TaskParams, inputs: Vec<FunctionInput>) -> Result<FunctionOutcome, ExecutionError> {
        tokio::time::sleep(self.delay).await;
        EchoExecutor.execute(params, inputs).await
    }
}
