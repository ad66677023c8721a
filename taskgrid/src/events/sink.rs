//! Event sinks.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, trace, Level};

use crate::utils::{now_utc, Timestamp};

/// Receiver of dispatcher lifecycle events.
///
/// Delivery problems are the sink's own business: neither method can fail
/// the dispatcher operation that emitted the event.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event, awaiting delivery.
    ///
    /// * `event_type` - one of [`crate::events::names`]
    /// * `data` - ids of the run, task and worker involved
    async fn emit(&self, event_type: &str, data: Option<Value>);

    /// Emits an event from synchronous code.
    fn try_emit(&self, event_type: &str, data: Option<Value>);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Turns events into `tracing` records.
///
/// `run_id`, `task_id` and `worker_id` found in the payload become
/// structured fields; the rest of the payload is logged as JSON text.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Logs at `level`. Levels above `INFO` are logged at `INFO`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    fn record(&self, event_type: &str, data: Option<&Value>) {
        let id = |name: &str| data.and_then(|d| d.get(name)).and_then(Value::as_u64);
        let (run_id, task_id, worker_id) = (id("run_id"), id("task_id"), id("worker_id"));
        let payload = data.map(ToString::to_string).unwrap_or_default();
        match self.level {
            Level::TRACE => trace!(event = event_type, run_id, task_id, worker_id, payload = %payload, "dispatcher event"),
            Level::DEBUG => debug!(event = event_type, run_id, task_id, worker_id, payload = %payload, "dispatcher event"),
            _ => info!(event = event_type, run_id, task_id, worker_id, payload = %payload, "dispatcher event"),
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.record(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.record(event_type, data.as_ref());
    }
}

/// One event kept by [`CollectingEventSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// Event name.
    pub name: String,
    /// Payload as emitted.
    pub data: Option<Value>,
    /// When the sink received it.
    pub received_on: Timestamp,
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<RecordedEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event received so far.
    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.read().clone()
    }

    /// Events with exactly this name.
    #[must_use]
    pub fn named(&self, name: &str) -> Vec<RecordedEvent> {
        self.events.read().iter().filter(|e| e.name == name).cloned().collect()
    }

    /// Number of events with this name.
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.events.read().iter().filter(|e| e.name == name).count()
    }

    /// Total number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// True if nothing was received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    fn push(&self, name: &str, data: Option<Value>) {
        self.events.write().push(RecordedEvent {
            name: name.to_string(),
            data,
            received_on: now_utc(),
        });
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.push(event_type, data);
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.push(event_type, data);
    }
}
