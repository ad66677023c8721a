//! Durable task records.
//!
//! The [`TaskStore`] trait is the persistence seam; [`InMemoryTaskStore`]
//! is the bundled implementation. Every mutating call is a compare-and-set
//! against the state the caller expects, so two concurrent assigners can
//! never both win the same task.

mod memory;

use async_trait::async_trait;

use crate::core::{NewTask, RunId, Task, TaskExecState, TaskId, TaskResult, WorkerId};
use crate::errors::StoreError;
use crate::utils::Timestamp;

pub use memory::InMemoryTaskStore;

/// A terminal outcome to record on a task.
#[derive(Debug, Clone)]
pub struct Completion {
    /// State the task must currently be in.
    pub from: TaskExecState,
    /// Worker that must hold the task, if the completion comes from a worker.
    pub worker: Option<WorkerId>,
    /// Terminal state to enter.
    pub state: TaskExecState,
    /// Result payload.
    pub result: TaskResult,
    /// Completion time.
    pub at: Timestamp,
}

/// Storage of task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts a task.
    ///
    /// Fails with [`StoreError::DuplicateTask`] if a task for the same
    /// (run, process, sub-context) exists that is not in `ERROR`.
    async fn insert(&self, task: NewTask, now: Timestamp) -> Result<Task, StoreError>;

    /// Fetches a task.
    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Every task of a run, ordered by id.
    async fn list_run(&self, run_id: RunId) -> Result<Vec<Task>, StoreError>;

    /// Every task in `state` across runs, ordered by id.
    async fn list_in_state(&self, state: TaskExecState) -> Result<Vec<Task>, StoreError>;

    /// Moves a task from `from` to `to`.
    async fn transition(&self, id: TaskId, from: TaskExecState, to: TaskExecState) -> Result<Task, StoreError>;

    /// Atomically moves an `ASSIGNABLE` task to `ASSIGNED` for `worker`.
    ///
    /// Returns [`StoreError::Conflict`] if the task is no longer assignable.
    async fn assign(&self, id: TaskId, worker: WorkerId, at: Timestamp) -> Result<Task, StoreError>;

    /// Records a terminal outcome.
    async fn complete(&self, id: TaskId, completion: Completion) -> Result<Task, StoreError>;

    /// Moves an `ASSIGNED` task held by `worker` back to `ASSIGNABLE`.
    async fn reclaim(&self, id: TaskId, worker: WorkerId) -> Result<Task, StoreError>;

    /// Deletes every task of a run. Returns the number removed.
    async fn delete_run(&self, run_id: RunId) -> Result<usize, StoreError>;
}
