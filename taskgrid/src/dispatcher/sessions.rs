//! Worker identities and their sessions.

use dashmap::DashMap;
use std::time::Duration;

use crate::core::{IdSequence, WorkerId};
use crate::utils::{elapsed_longer_than, generate_session_id, Timestamp};

#[derive(Debug, Clone)]
struct Session {
    session_id: String,
    tags: Vec<String>,
    last_seen: Timestamp,
}

/// Issues worker ids and validates sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<WorkerId, Session>,
    ids: IdSequence,
    ttl: Duration,
}

impl SessionRegistry {
    /// Creates a registry whose sessions expire after `ttl` of inactivity.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ids: IdSequence::default(),
            ttl,
        }
    }

    /// Issues a new identity.
    pub fn identify(&self, tags: Vec<String>, now: Timestamp) -> (WorkerId, String) {
        let worker_id = WorkerId::new(self.ids.next_id());
        let session_id = generate_session_id();
        self.sessions.insert(
            worker_id,
            Session {
                session_id: session_id.clone(),
                tags,
                last_seen: now,
            },
        );
        (worker_id, session_id)
    }

    /// Validates a session and refreshes it. Returns the worker's tags.
    ///
    /// Unknown workers, mismatched session ids and expired sessions all
    /// yield `None`; an expired session is dropped.
    pub fn touch(&self, worker_id: WorkerId, session_id: &str, now: Timestamp) -> Option<Vec<String>> {
        let mut session = self.sessions.get_mut(&worker_id)?;
        if session.session_id != session_id {
            return None;
        }
        if elapsed_longer_than(session.last_seen, now, self.ttl) {
            drop(session);
            self.sessions.remove(&worker_id);
            return None;
        }
        session.last_seen = now;
        Some(session.tags.clone())
    }

    /// Replaces the tags of a live session.
    pub fn update_tags(&self, worker_id: WorkerId, tags: Vec<String>) {
        if let Some(mut session) = self.sessions.get_mut(&worker_id) {
            session.tags = tags;
        }
    }

    /// Drops sessions idle longer than the TTL. Returns how many were dropped.
    ///
    /// Sessions issued while the sweep runs are never counted.
    pub fn evict_expired(&self, now: Timestamp) -> usize {
        let mut evicted = 0;
        self.sessions.retain(|_, s| {
            let expired = elapsed_longer_than(s.last_seen, now, self.ttl);
            evicted += usize::from(expired);
            !expired
        });
        evicted
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if no session exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::now_utc;
    use std::sync::Arc;

    #[test]
    fn test_identify_and_touch() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let now = now_utc();
        let (worker, session) = registry.identify(vec!["gpu".into()], now);
        let (other, _) = registry.identify(Vec::new(), now);
        assert_ne!(worker, other);

        assert_eq!(registry.touch(worker, &session, now), Some(vec!["gpu".to_string()]));
        assert_eq!(registry.touch(worker, "forged", now), None);
        assert_eq!(registry.touch(WorkerId::new(99), &session, now), None);
    }

    #[test]
    fn test_expired_session_must_reidentify() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let start = now_utc();
        let (worker, session) = registry.identify(Vec::new(), start);

        let later = start + chrono::Duration::seconds(30);
        assert!(registry.touch(worker, &session, later).is_some());

        let much_later = later + chrono::Duration::seconds(61);
        assert!(registry.touch(worker, &session, much_later).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_evict_and_update_tags() {
        let registry = SessionRegistry::new(Duration::from_secs(10));
        let start = now_utc();
        let (worker, session) = registry.identify(Vec::new(), start);
        registry.identify(Vec::new(), start - chrono::Duration::seconds(20));

        registry.update_tags(worker, vec!["cpu".into()]);
        assert_eq!(registry.evict_expired(start), 1);
        assert_eq!(registry.touch(worker, &session, start), Some(vec!["cpu".to_string()]));
    }

    #[test]
    fn test_evict_while_identifying_counts_only_expired() {
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(10)));
        let start = now_utc();
        for _ in 0..50 {
            registry.identify(Vec::new(), start - chrono::Duration::seconds(20));
        }

        let writer = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    registry.identify(Vec::new(), start);
                }
            })
        };
        let mut evicted = 0;
        for _ in 0..20 {
            evicted += registry.evict_expired(start);
        }
        writer.join().unwrap();
        evicted += registry.evict_expired(start);

        assert_eq!(evicted, 50);
        assert_eq!(registry.len(), 500);
    }
}
