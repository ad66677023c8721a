//! Dispatcher lifecycle events.
//!
//! The dispatcher reports what happens to runs and tasks through an
//! [`EventSink`] it is constructed with. Event names are the constants in
//! [`names`]; payloads are small JSON objects carrying the ids involved.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink, RecordedEvent};

/// Event type names emitted by the dispatcher.
pub mod names {
    /// A run was registered and validated (or marked invalid).
    pub const RUN_REGISTERED: &str = "run.registered";
    /// A task record was created.
    pub const TASK_PRODUCED: &str = "task.produced";
    /// A task was completed from the result cache.
    pub const TASK_CACHE_HIT: &str = "task.cache_hit";
    /// A task was handed to a worker.
    pub const TASK_ASSIGNED: &str = "task.assigned";
    /// A worker result moved a task to a terminal state.
    pub const TASK_FINISHED: &str = "task.finished";
    /// A result report was rejected without state change.
    pub const TASK_RESULT_REJECTED: &str = "task.result_rejected";
    /// A stale assignment was reclaimed.
    pub const TASK_RECLAIMED: &str = "task.reclaimed";
    /// Idle worker sessions were dropped.
    pub const SESSIONS_EVICTED: &str = "session.evicted";
    /// A run reached a terminal state.
    pub const RUN_COMPLETED: &str = "run.completed";
}
