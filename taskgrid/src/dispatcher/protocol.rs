//! Request and response envelopes exchanged with processors.
//!
//! An envelope carries at most one command. Binary output data travels as
//! base64 strings so the same envelopes encode to JSON and YAML.

use serde::{Deserialize, Serialize};

use crate::core::{TaskId, WorkerId};
use crate::errors::TransportError;
use crate::graph::DocumentFormat;

/// Header carrying the worker id on variable downloads.
pub const WORKER_ID_HEADER: &str = "x-taskgrid-worker";
/// Header carrying the session id on variable downloads.
pub const SESSION_ID_HEADER: &str = "x-taskgrid-session";

/// A processor request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RequestEnvelope {
    /// Worker id issued by the dispatcher; absent before identification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    /// Session id issued with the worker id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// The command.
    #[serde(default)]
    pub body: RequestBody,
}

impl RequestEnvelope {
    /// A request without identity.
    #[must_use]
    pub fn anonymous(body: RequestBody) -> Self {
        Self {
            worker_id: None,
            session_id: None,
            body,
        }
    }

    /// A request from an identified worker.
    #[must_use]
    pub fn from_worker(worker_id: WorkerId, session_id: impl Into<String>, body: RequestBody) -> Self {
        Self {
            worker_id: Some(worker_id),
            session_id: Some(session_id.into()),
            body,
        }
    }
}

/// Commands a processor can send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestBody {
    /// Ask for a worker id and session.
    Identify {
        /// Tags the worker accepts.
        #[serde(default)]
        tags: Vec<String>,
    },
    /// Ask for one task.
    Poll,
    /// Report the outcome of a task.
    ReportResult {
        /// The finished task.
        task_id: TaskId,
        /// Outcome.
        result: ResultReport,
    },
    /// Refresh the session and advertise current state.
    ReportStatus {
        /// Current status.
        status: WorkerStatus,
    },
    /// Nothing to say.
    #[default]
    Empty,
}

/// Outcome state reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedState {
    /// The function succeeded.
    Ok,
    /// The function failed.
    Error,
}

/// Data of one output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum OutputPayload {
    /// Produced bytes.
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    /// The function produced no value.
    Nullified,
}

/// One named output in a result report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputData {
    /// Output name as declared by the process.
    pub name: String,
    /// Payload.
    pub payload: OutputPayload,
}

/// A worker's result for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultReport {
    /// Outcome.
    pub state: ReportedState,
    /// Exit code of the function, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Console output or error text.
    #[serde(default)]
    pub console: String,
    /// Outputs by name.
    #[serde(default)]
    pub outputs: Vec<OutputData>,
}

impl ResultReport {
    /// A successful report.
    #[must_use]
    pub fn ok(outputs: Vec<OutputData>) -> Self {
        Self {
            state: ReportedState::Ok,
            exit_code: Some(0),
            console: String::new(),
            outputs,
        }
    }

    /// A failed report.
    #[must_use]
    pub fn error(exit_code: i32, console: impl Into<String>) -> Self {
        Self {
            state: ReportedState::Error,
            exit_code: Some(exit_code),
            console: console.into(),
            outputs: Vec::new(),
        }
    }

    /// Adds an output with bytes.
    #[must_use]
    pub fn with_bytes(mut self, name: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.outputs.push(OutputData {
            name: name.into(),
            payload: OutputPayload::Bytes(bytes),
        });
        self
    }

    /// Adds a nullified output.
    #[must_use]
    pub fn with_nullified(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(OutputData {
            name: name.into(),
            payload: OutputPayload::Nullified,
        });
        self
    }

    /// Looks up an output by name.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&OutputPayload> {
        self.outputs.iter().find(|o| o.name == name).map(|o| &o.payload)
    }
}

/// Periodic worker status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WorkerStatus {
    /// Tags the worker accepts.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Tasks the worker is executing or holding results for.
    #[serde(default)]
    pub task_ids: Vec<TaskId>,
}

/// A task handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// The task.
    pub task_id: TaskId,
    /// Parameter blob, see [`crate::core::TaskParams::from_wire`].
    pub params: String,
}

/// Dispatcher answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    /// The session is unknown or expired.
    ReIdentify,
    /// Identity issued to the worker.
    Identity {
        /// New worker id.
        worker_id: WorkerId,
        /// New session id.
        session_id: String,
    },
    /// A task to execute.
    Task(Assignment),
    /// Outcome of a report.
    Ack {
        /// False if the report was rejected.
        accepted: bool,
    },
    /// Nothing to hand out.
    #[default]
    Empty,
}

/// Encodes a protocol value.
pub fn encode<T: Serialize>(value: &T, format: DocumentFormat) -> Result<String, TransportError> {
    match format {
        DocumentFormat::Json => serde_json::to_string(value).map_err(|e| TransportError::Codec(e.to_string())),
        DocumentFormat::Yaml => serde_yaml::to_string(value).map_err(|e| TransportError::Codec(e.to_string())),
    }
}

/// Decodes a protocol value.
pub fn decode<T: serde::de::DeserializeOwned>(text: &str, format: DocumentFormat) -> Result<T, TransportError> {
    match format {
        DocumentFormat::Json => serde_json::from_str(text).map_err(|e| TransportError::Codec(e.to_string())),
        DocumentFormat::Yaml => serde_yaml::from_str(text).map_err(|e| TransportError::Codec(e.to_string())),
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn report_request() -> RequestEnvelope {
        RequestEnvelope::from_worker(
            WorkerId::new(3),
            "s-1",
            RequestBody::ReportResult {
                task_id: TaskId::new(9),
                result: ResultReport::ok(Vec::new())
                    .with_bytes("out", vec![0, 159, 146, 150, 255])
                    .with_nullified("maybe"),
            },
        )
    }

    #[test]
    fn test_bytes_travel_as_base64() {
        let json = encode(&report_request(), DocumentFormat::Json).unwrap();
        assert!(json.contains("\"AJ+Slv8=\""));
        assert!(json.contains("\"type\":\"report_result\""));
        let back: RequestEnvelope = decode(&json, DocumentFormat::Json).unwrap();
        assert_eq!(back, report_request());
    }

    #[test]
    fn test_yaml_codec() {
        let yaml = encode(&report_request(), DocumentFormat::Yaml).unwrap();
        let back: RequestEnvelope = decode(&yaml, DocumentFormat::Yaml).unwrap();
        assert_eq!(back, report_request());

        let response = ResponseBody::Task(Assignment {
            task_id: TaskId::new(1),
            params: "{}".into(),
        });
        let yaml = encode(&response, DocumentFormat::Yaml).unwrap();
        assert_eq!(decode::<ResponseBody>(&yaml, DocumentFormat::Yaml).unwrap(), response);
    }

    #[test]
    fn test_missing_body_is_empty() {
        let envelope: RequestEnvelope = decode(r#"{"worker_id": 4}"#, DocumentFormat::Json).unwrap();
        assert_eq!(envelope.worker_id, Some(WorkerId::new(4)));
        assert_eq!(envelope.body, RequestBody::Empty);
    }

    #[test]
    fn test_garbage_is_a_codec_error() {
        let err = decode::<RequestEnvelope>("{not json", DocumentFormat::Json).unwrap_err();
        assert!(matches!(err, TransportError::Codec(_)));
    }
}
