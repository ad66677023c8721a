//! Task and run state enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The execution state of a task.
///
/// ```text
/// NONE -> ASSIGNABLE -> ASSIGNED -> OK | ERROR
///   |                      |
///   |                      +-> ASSIGNABLE   (stale reclamation)
///   +-> IN_CACHE_CHECK -> OK | ASSIGNABLE | ERROR
///   +-> SKIPPED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskExecState {
    /// Created, not yet runnable.
    #[default]
    None,
    /// All inputs resolved; waiting for a worker.
    Assignable,
    /// Handed to exactly one worker.
    Assigned,
    /// Transient state while the result cache is consulted.
    InCacheCheck,
    /// Finished successfully.
    Ok,
    /// Finished with an error.
    Error,
    /// Never executed because its condition was false or a needed input was skipped.
    Skipped,
}

impl TaskExecState {
    /// Returns true if no transition leaves this state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ok | Self::Error | Self::Skipped)
    }

    /// Returns true if the state machine permits `self -> next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::None => matches!(next, Self::Assignable | Self::InCacheCheck | Self::Skipped),
            Self::InCacheCheck => matches!(next, Self::Ok | Self::Assignable | Self::Error),
            Self::Assignable => next == Self::Assigned,
            Self::Assigned => matches!(next, Self::Ok | Self::Error | Self::Assignable),
            Self::Ok | Self::Error | Self::Skipped => false,
        }
    }
}

impl fmt::Display for TaskExecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Assignable => write!(f, "ASSIGNABLE"),
            Self::Assigned => write!(f, "ASSIGNED"),
            Self::InCacheCheck => write!(f, "IN_CACHE_CHECK"),
            Self::Ok => write!(f, "OK"),
            Self::Error => write!(f, "ERROR"),
            Self::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// The lifecycle state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Registered, first production pass pending.
    #[default]
    Producing,
    /// Tasks are being produced and executed.
    Started,
    /// Every node finished successfully or was skipped.
    Completed,
    /// At least one node failed or is permanently blocked.
    CompletedWithErrors,
    /// The graph failed validation; no tasks are produced.
    Invalid,
}

impl RunState {
    /// Returns true if the run accepts no further work.
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::CompletedWithErrors | Self::Invalid)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Producing => write!(f, "PRODUCING"),
            Self::Started => write!(f, "STARTED"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::CompletedWithErrors => write!(f, "COMPLETED_WITH_ERRORS"),
            Self::Invalid => write!(f, "INVALID"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_exits() {
        let all = [
            TaskExecState::None,
            TaskExecState::Assignable,
            TaskExecState::Assigned,
            TaskExecState::InCacheCheck,
            TaskExecState::Ok,
            TaskExecState::Error,
            TaskExecState::Skipped,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in &all {
                assert!(!from.can_transition_to(*to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_assignment_path() {
        assert!(TaskExecState::None.can_transition_to(TaskExecState::Assignable));
        assert!(TaskExecState::Assignable.can_transition_to(TaskExecState::Assigned));
        assert!(TaskExecState::Assigned.can_transition_to(TaskExecState::Ok));
        assert!(TaskExecState::Assigned.can_transition_to(TaskExecState::Error));
        assert!(!TaskExecState::Assignable.can_transition_to(TaskExecState::Ok));
        assert!(!TaskExecState::None.can_transition_to(TaskExecState::Assigned));
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&TaskExecState::InCacheCheck).unwrap();
        assert_eq!(json, "\"IN_CACHE_CHECK\"");
        let json = serde_json::to_string(&RunState::CompletedWithErrors).unwrap();
        assert_eq!(json, "\"COMPLETED_WITH_ERRORS\"");
    }
}
