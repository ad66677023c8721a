//! Utility functions for timestamps and session identifiers.

pub mod timestamps;

pub use timestamps::{elapsed_longer_than, iso_timestamp, now_utc, Timestamp};

/// Generates a random session identifier.
#[must_use]
pub fn generate_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique_uuids() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
        assert_eq!(uuid::Uuid::parse_str(&a).unwrap().get_version_num(), 4);
    }
}
