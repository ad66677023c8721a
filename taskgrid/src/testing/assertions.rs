//! Assertions over tasks and runs.

use crate::core::{RunId, RunState, Task, TaskExecState};
use crate::dispatcher::Dispatcher;

/// Asserts the (process code, state) pairs of `tasks`, in order.
///
/// # Panics
///
/// Panics if the states differ.
pub fn assert_states(tasks: &[Task], expected: &[(&str, TaskExecState)]) {
    let actual: Vec<(&str, TaskExecState)> = tasks.iter().map(|t| (t.process_code(), t.exec_state)).collect();
    assert_eq!(actual, expected, "task states differ");
}

/// Asserts the state of a registered run.
///
/// # Panics
///
/// Panics if the run is unknown or in another state.
pub async fn assert_run_state(dispatcher: &Dispatcher, run_id: RunId, expected: RunState) {
    match dispatcher.run_status(run_id).await {
        Ok(status) => assert_eq!(
            status.state, expected,
            "run {run_id} is {} (first error: {:?})",
            status.state, status.first_error
        ),
        Err(e) => panic!("run {run_id}: {e}"),
    }
}
