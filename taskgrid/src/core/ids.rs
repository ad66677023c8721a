//! Numeric identifiers for runs, tasks, variables and workers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw id.
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw id.
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

numeric_id!(
    /// Identifies one pipeline run.
    RunId
);
numeric_id!(
    /// Identifies one task record.
    TaskId
);
numeric_id!(
    /// Identifies one variable record and its blob.
    VariableId
);
numeric_id!(
    /// Identifies a processor registered with a dispatcher.
    WorkerId
);

/// Monotonic id allocator. Ids start at 1.
#[derive(Debug)]
pub struct IdSequence {
    next: AtomicU64,
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl IdSequence {
    /// Creates a sequence whose first id is `first`.
    #[must_use]
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Allocates the next id.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_monotonic() {
        let seq = IdSequence::default();
        assert_eq!(seq.next_id(), 1);
        assert_eq!(seq.next_id(), 2);

        let seq = IdSequence::starting_at(100);
        assert_eq!(seq.next_id(), 100);
    }

    #[test]
    fn test_ids_serialize_as_numbers() {
        let id = TaskId::new(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        assert_eq!(id.to_string(), "42");
        let back: TaskId = serde_json::from_str("42").unwrap();
        assert_eq!(back, id);
    }
}
