//! Message schema spoken between the runcell worker channel and the
//! execution worker.
//!
//! Both sides serialize every envelope to JSON before it crosses the worker
//! boundary, so the types here are the single source of truth for the wire
//! format. The envelope carries [`PROTOCOL_VERSION`]; a peer that sees a
//! different version must reject the message loudly rather than guess.
//!
//! Requests look like:
//! ```json
//! { "id": "7f1c…", "version": 1, "kind": "run", "payload": { "code": "print(1)" } }
//! ```
//! and responses like:
//! ```json
//! { "id": "7f1c…", "version": 1, "kind": "run", "result": { "status": "success", "output": "1" } }
//! ```

pub mod files;
pub mod result;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use files::{GeneratedFile, MountedFile};
pub use result::{ExecutionFailure, ExecutionOutput, ExecutionResult};

/// Version of the envelope schema. Bump whenever a field changes meaning.
pub const PROTOCOL_VERSION: u32 = 1;

/// Opaque correlation token matching a response to the request that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generates a fresh, globally unique id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// A code submission for a single run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSubmission {
    pub code: String,
}

impl CodeSubmission {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }
}

/// Discriminates the two operations a worker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Mount,
    Run,
}

impl RequestKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mount => "mount",
            Self::Run => "run",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation-specific request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum RequestPayload {
    Mount(Vec<MountedFile>),
    Run(CodeSubmission),
}

impl RequestPayload {
    pub const fn kind(&self) -> RequestKind {
        match self {
            Self::Mount(_) => RequestKind::Mount,
            Self::Run(_) => RequestKind::Run,
        }
    }
}

/// Envelope sent from the channel to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: RequestId,
    pub version: u32,
    #[serde(flatten)]
    pub payload: RequestPayload,
}

impl WorkerRequest {
    /// Wraps a payload in an envelope stamped with the current version.
    pub fn new(id: RequestId, payload: RequestPayload) -> Self {
        Self {
            id,
            version: PROTOCOL_VERSION,
            payload,
        }
    }
}

/// Minimal view of an envelope, used to recover the correlation id and
/// version even when the rest of the message does not parse.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeHeader {
    pub id: RequestId,
    #[serde(default)]
    pub version: u32,
}

/// Acknowledgement for a mount request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountAck {
    /// Names written into the sandbox root, in request order.
    pub mounted: Vec<String>,
}

/// Why the worker refused to service a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultReason {
    /// The language runtime could not be loaded. Fatal for the worker.
    Initialization,
    VersionMismatch,
    MalformedRequest,
    Filesystem,
}

impl FaultReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialization => "initialization",
            Self::VersionMismatch => "version_mismatch",
            Self::MalformedRequest => "malformed_request",
            Self::Filesystem => "filesystem",
        }
    }
}

/// A request-level failure that is not an execution error of the code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFault {
    pub reason: FaultReason,
    pub message: String,
}

impl WorkerFault {
    pub fn new(reason: FaultReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl fmt::Display for WorkerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason.as_str(), self.message)
    }
}

/// Operation-specific response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "result", rename_all = "snake_case")]
pub enum ResponsePayload {
    Mount(MountAck),
    Run(ExecutionResult),
    Fault(WorkerFault),
}

impl ResponsePayload {
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Mount(_) => "mount",
            Self::Run(_) => "run",
            Self::Fault(_) => "fault",
        }
    }
}

/// Envelope sent from the worker back to the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: RequestId,
    pub version: u32,
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

impl WorkerResponse {
    pub fn new(id: RequestId, payload: ResponsePayload) -> Self {
        Self {
            id,
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    pub fn fault(id: RequestId, reason: FaultReason, message: impl Into<String>) -> Self {
        Self::new(id, ResponsePayload::Fault(WorkerFault::new(reason, message)))
    }
}

/// JSON helpers for moving envelopes across the worker boundary.
#[cfg(feature = "serde-json")]
pub mod json {
    use super::{EnvelopeHeader, WorkerRequest, WorkerResponse};

    pub fn encode_request(request: &WorkerRequest) -> serde_json::Result<String> {
        serde_json::to_string(request)
    }

    pub fn decode_request(payload: &str) -> serde_json::Result<WorkerRequest> {
        serde_json::from_str(payload)
    }

    pub fn encode_response(response: &WorkerResponse) -> serde_json::Result<String> {
        serde_json::to_string(response)
    }

    pub fn decode_response(payload: &str) -> serde_json::Result<WorkerResponse> {
        serde_json::from_str(payload)
    }

    /// Reads only the id and version of an envelope.
    pub fn decode_header(payload: &str) -> serde_json::Result<EnvelopeHeader> {
        serde_json::from_str(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn run_request_uses_flat_envelope() {
        let request = WorkerRequest::new(
            RequestId::from("req-1"),
            RequestPayload::Run(CodeSubmission::new("print(1)")),
        );

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "req-1",
                "version": PROTOCOL_VERSION,
                "kind": "run",
                "payload": { "code": "print(1)" }
            })
        );
    }

    #[test]
    fn mount_request_encodes_bytes_as_base64() {
        let request = WorkerRequest::new(
            RequestId::from("req-2"),
            RequestPayload::Mount(vec![MountedFile::new("data.csv", b"a,b\n".to_vec())]),
        );

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["kind"], "mount");
        assert_eq!(value["payload"][0]["name"], "data.csv");
        assert_eq!(value["payload"][0]["bytes"], "YSxiCg==");
    }

    #[test]
    fn fault_response_decodes() {
        let raw = r#"{"id":"x","version":1,"kind":"fault","result":{"reason":"initialization","message":"no python"}}"#;
        let response = json::decode_response(raw).unwrap();
        assert_eq!(response.id.as_str(), "x");
        assert_eq!(
            response.payload,
            ResponsePayload::Fault(WorkerFault::new(FaultReason::Initialization, "no python"))
        );
    }

    #[test]
    fn header_survives_unknown_kind() {
        let raw = r#"{"id":"abc","version":7,"kind":"explode","payload":null}"#;
        assert!(json::decode_request(raw).is_err());

        let header = json::decode_header(raw).unwrap();
        assert_eq!(header.id.as_str(), "abc");
        assert_eq!(header.version, 7);
    }

    #[test]
    fn generated_ids_are_unique() {
        let first = RequestId::generate();
        let second = RequestId::generate();
        assert_ne!(first, second);
    }
}
