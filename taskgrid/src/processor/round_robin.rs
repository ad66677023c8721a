//! Endpoint selection across poll cycles.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::endpoint::DispatcherEndpoint;
use crate::errors::ConfigError;

/// Cycles through the enabled endpoints in configured order.
///
/// The endpoint list is fixed at construction. A single atomic cursor over
/// it gives each endpoint exactly one turn per cycle no matter how many
/// loops call [`RoundRobin::next`] or how slow each endpoint answers.
#[derive(Debug)]
pub struct RoundRobin {
    endpoints: Arc<[DispatcherEndpoint]>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    /// Builds the rotation from the enabled entries of `endpoints`.
    ///
    /// Fails with [`ConfigError::NoEndpoints`] if none is enabled.
    pub fn new(endpoints: &[DispatcherEndpoint]) -> Result<Self, ConfigError> {
        let enabled: Arc<[DispatcherEndpoint]> = endpoints.iter().filter(|e| e.enabled).cloned().collect();
        if enabled.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        Ok(Self {
            endpoints: enabled,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Returns the position in [`RoundRobin::endpoints`] of this cycle's turn.
    pub fn next_index(&self) -> usize {
        let len = self.endpoints.len();
        let turn = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % len))
            .unwrap_or(0);
        turn % len
    }

    /// Returns the endpoint for this cycle.
    pub fn next(&self) -> &DispatcherEndpoint {
        &self.endpoints[self.next_index()]
    }

    /// The enabled endpoints in rotation order.
    #[must_use]
    pub fn endpoints(&self) -> &[DispatcherEndpoint] {
        &self.endpoints
    }

    /// Number of endpoints in the rotation.
    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Always false: an empty rotation cannot be built.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn endpoints() -> Vec<DispatcherEndpoint> {
        vec![
            DispatcherEndpoint::new("http://a"),
            DispatcherEndpoint::new("http://off").disabled(),
            DispatcherEndpoint::new("http://b"),
            DispatcherEndpoint::new("http://c"),
        ]
    }

    #[test]
    fn test_each_endpoint_once_per_cycle() {
        let rr = RoundRobin::new(&endpoints()).unwrap();
        let first: Vec<&str> = (0..3).map(|_| rr.next().url.as_str()).collect();
        assert_eq!(first, vec!["http://a", "http://b", "http://c"]);
        assert_eq!(rr.next().url, "http://a");
    }

    #[test]
    fn test_no_enabled_endpoint_is_fatal() {
        let only_disabled = vec![DispatcherEndpoint::new("http://x").disabled()];
        assert!(matches!(RoundRobin::new(&only_disabled), Err(ConfigError::NoEndpoints)));
        assert!(matches!(RoundRobin::new(&[]), Err(ConfigError::NoEndpoints)));
    }

    #[test]
    fn test_fair_under_concurrency() {
        let rr = Arc::new(RoundRobin::new(&endpoints()).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let rr = Arc::clone(&rr);
                std::thread::spawn(move || (0..30).map(|_| rr.next().url.clone()).collect::<Vec<_>>())
            })
            .collect();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for handle in handles {
            for url in handle.join().unwrap() {
                *counts.entry(url).or_default() += 1;
            }
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&n| n == 40));
    }
}
