//! Core domain model types for taskgrid.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Numeric ids for runs, tasks, variables and workers
//! - The task and run state machines
//! - Task records and the parameter blob handed to workers

mod ids;
mod status;
mod task;

pub use ids::{IdSequence, RunId, TaskId, VariableId, WorkerId};
pub use status::{RunState, TaskExecState};
pub use task::{InputLocator, NewTask, Task, TaskInput, TaskKey, TaskOutput, TaskParams, TaskResult};
