//! Request/response client for the single execution worker.
//!
//! Every request gets a fresh [`RequestId`] and a pending entry holding a
//! oneshot responder. A dispatch task reads the worker's replies and settles
//! the entry with the matching id; anything it cannot match is dropped and
//! counted. Each request settles exactly once: by its response, by its
//! timeout, or by the worker going away.

mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use runcell_config::TimeoutsConfig;
use runcell_protocol::{
    CodeSubmission, ExecutionResult, MountedFile, PROTOCOL_VERSION, RequestId, RequestKind,
    RequestPayload, ResponsePayload, WorkerFault, WorkerRequest, json,
};
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub use transport::{ThreadSpawner, WorkerLink, WorkerSpawner};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to start execution worker: {0}")]
    Spawn(String),

    #[error("{kind} request timed out after {after:?}")]
    Timeout { kind: RequestKind, after: Duration },

    #[error("execution worker disconnected")]
    Disconnected,

    #[error("execution worker refused the request: {0}")]
    Worker(WorkerFault),

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("expected a {expected} response, received {received}")]
    UnexpectedResponse {
        expected: RequestKind,
        received: &'static str,
    },
}

impl ChannelError {
    /// Failures of the boundary itself, as opposed to answers from the worker.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Disconnected)
    }
}

struct PendingRequest {
    kind: RequestKind,
    created_at: Instant,
    responder: oneshot::Sender<ResponsePayload>,
}

#[derive(Default)]
struct ChannelShared {
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    dropped_responses: AtomicU64,
}

impl ChannelShared {
    fn deliver(&self, raw: &str) {
        let response = match json::decode_response(raw) {
            Ok(response) => response,
            Err(err) => {
                self.record_drop();
                warn!(error = %err, "dropping malformed worker response");
                return;
            }
        };
        if response.version != PROTOCOL_VERSION {
            self.record_drop();
            warn!(
                request_id = %response.id,
                received = response.version,
                expected = PROTOCOL_VERSION,
                "dropping response with mismatched protocol version"
            );
            return;
        }

        let Some(pending) = self.pending.lock().remove(&response.id) else {
            self.record_drop();
            debug!(
                request_id = %response.id,
                kind = response.payload.kind_name(),
                "dropping unmatched or late response"
            );
            return;
        };

        debug!(
            request_id = %response.id,
            kind = %pending.kind,
            elapsed = ?pending.created_at.elapsed(),
            "response matched"
        );
        if pending.responder.send(response.payload).is_err() {
            debug!(request_id = %response.id, "requester went away before the response");
        }
    }

    fn record_drop(&self) {
        self.dropped_responses.fetch_add(1, Ordering::Relaxed);
    }
}

/// Removes its pending entry when the request settles or its future is
/// dropped, so abandoned requests never linger in the map.
struct PendingSlot<'a> {
    shared: &'a ChannelShared,
    id: RequestId,
}

impl<'a> PendingSlot<'a> {
    fn register(
        shared: &'a ChannelShared,
        id: RequestId,
        kind: RequestKind,
        responder: oneshot::Sender<ResponsePayload>,
    ) -> Self {
        shared.pending.lock().insert(
            id.clone(),
            PendingRequest {
                kind,
                created_at: Instant::now(),
                responder,
            },
        );
        Self { shared, id }
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.id);
    }
}

/// Owns the one execution worker and correlates its responses.
pub struct WorkerChannel {
    spawner: Arc<dyn WorkerSpawner>,
    timeouts: TimeoutsConfig,
    outbound: OnceCell<UnboundedSender<String>>,
    shared: Arc<ChannelShared>,
}

impl WorkerChannel {
    pub fn new(spawner: Arc<dyn WorkerSpawner>, timeouts: TimeoutsConfig) -> Self {
        Self {
            spawner,
            timeouts,
            outbound: OnceCell::new(),
            shared: Arc::new(ChannelShared::default()),
        }
    }

    pub fn timeouts(&self) -> &TimeoutsConfig {
        &self.timeouts
    }

    /// Starts the worker on first use. Later calls return the same link; a
    /// failed spawn leaves the channel without a worker so the next call
    /// tries again. Must be called from within a tokio runtime.
    pub fn ensure_worker(&self) -> Result<&UnboundedSender<String>, ChannelError> {
        self.outbound.get_or_try_init(|| {
            let link = self
                .spawner
                .spawn()
                .map_err(|err| ChannelError::Spawn(format!("{err:#}")))?;
            debug!("execution worker started");
            tokio::spawn(dispatch(Arc::clone(&self.shared), link.inbound));
            Ok(link.outbound)
        })
    }

    pub fn is_started(&self) -> bool {
        self.outbound.get().is_some()
    }

    /// Copies files into the sandbox root. Waits for the acknowledgement
    /// up to the mount timeout, then carries on as if it had arrived.
    pub async fn mount_files(&self, files: Vec<MountedFile>) -> Result<(), ChannelError> {
        if files.is_empty() {
            return Ok(());
        }
        let budget = self.timeouts.mount_timeout();
        match self.request(RequestPayload::Mount(files), budget).await {
            Ok(ResponsePayload::Mount(ack)) => {
                debug!(mounted = ?ack.mounted, "files mounted");
                Ok(())
            }
            Ok(ResponsePayload::Fault(fault)) => Err(ChannelError::Worker(fault)),
            Ok(other) => Err(ChannelError::UnexpectedResponse {
                expected: RequestKind::Mount,
                received: other.kind_name(),
            }),
            Err(ChannelError::Timeout { after, .. }) => {
                warn!(?after, "mount not acknowledged in time; continuing");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Runs `code` in the worker. An error raised by the code is a normal
    /// `Ok(ExecutionResult::Error(..))`.
    pub async fn run(&self, code: impl Into<String>) -> Result<ExecutionResult, ChannelError> {
        let payload = RequestPayload::Run(CodeSubmission::new(code));
        match self.request(payload, self.timeouts.run_timeout()).await? {
            ResponsePayload::Run(result) => Ok(result),
            ResponsePayload::Fault(fault) => Err(ChannelError::Worker(fault)),
            other => Err(ChannelError::UnexpectedResponse {
                expected: RequestKind::Run,
                received: other.kind_name(),
            }),
        }
    }

    async fn request(
        &self,
        payload: RequestPayload,
        budget: Duration,
    ) -> Result<ResponsePayload, ChannelError> {
        let outbound = self.ensure_worker()?;
        let id = RequestId::generate();
        let kind = payload.kind();
        let encoded = json::encode_request(&WorkerRequest::new(id.clone(), payload))?;

        let (responder, receiver) = oneshot::channel();
        let _slot = PendingSlot::register(&self.shared, id.clone(), kind, responder);
        outbound
            .send(encoded)
            .map_err(|_| ChannelError::Disconnected)?;
        debug!(request_id = %id, %kind, "request sent");

        match tokio::time::timeout(budget, receiver).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(ChannelError::Disconnected),
            Err(_) => {
                warn!(request_id = %id, %kind, ?budget, "request timed out");
                Err(ChannelError::Timeout {
                    kind,
                    after: budget,
                })
            }
        }
    }

    /// Responses discarded because they were malformed, carried the wrong
    /// version, or matched no pending request.
    pub fn dropped_responses(&self) -> u64 {
        self.shared.dropped_responses.load(Ordering::Relaxed)
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.pending.lock().len()
    }
}

async fn dispatch(shared: Arc<ChannelShared>, mut inbound: UnboundedReceiver<String>) {
    while let Some(raw) = inbound.recv().await {
        shared.deliver(&raw);
    }
    // Dropping the responders settles every waiter with `Disconnected`.
    let abandoned = shared.pending.lock().drain().count();
    warn!(abandoned, "execution worker link closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Reply, ScriptedSpawner};
    use pretty_assertions::assert_eq;
    use runcell_protocol::{ExecutionOutput, FaultReason, MountAck};

    fn timeouts() -> TimeoutsConfig {
        TimeoutsConfig {
            mount_timeout_ms: 500,
            run_timeout_secs: 2,
        }
    }

    fn printed(text: &str) -> ResponsePayload {
        ResponsePayload::Run(ExecutionResult::Success(ExecutionOutput {
            output: Some(text.to_owned()),
            ..ExecutionOutput::default()
        }))
    }

    fn code_of(request: &WorkerRequest) -> &str {
        match &request.payload {
            RequestPayload::Run(submission) => &submission.code,
            RequestPayload::Mount(_) => "",
        }
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_responses_reach_their_own_callers() {
        let spawner = ScriptedSpawner::new(|request| {
            let delay = if code_of(request) == "A" { 200 } else { 50 };
            vec![Reply::payload(
                request,
                Duration::from_millis(delay),
                printed(code_of(request)),
            )]
        });
        let channel = WorkerChannel::new(Arc::new(spawner), timeouts());

        let (a, b) = tokio::join!(channel.run("A"), channel.run("B"));
        assert_eq!(a.unwrap().output(), Some("A"));
        assert_eq!(b.unwrap().output(), Some("B"));
        assert_eq!(channel.pending_requests(), 0);
        assert_eq!(channel.dropped_responses(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_rejects_at_the_timeout_boundary() {
        let channel = WorkerChannel::new(Arc::new(ScriptedSpawner::silent()), timeouts());
        let started = tokio::time::Instant::now();

        let err = channel.run("while True: pass").await.unwrap_err();
        assert!(matches!(err, ChannelError::Timeout { kind: RequestKind::Run, .. }));
        assert!(err.is_transport());
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(channel.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn response_just_inside_the_budget_resolves() {
        let spawner = ScriptedSpawner::new(|request| {
            vec![Reply::payload(request, Duration::from_millis(1_999), printed("late but fine"))]
        });
        let channel = WorkerChannel::new(Arc::new(spawner), timeouts());

        let result = channel.run("slow()").await.unwrap();
        assert_eq!(result.output(), Some("late but fine"));
    }

    #[tokio::test(start_paused = true)]
    async fn late_and_duplicate_responses_are_counted() {
        let spawner = ScriptedSpawner::new(|request| match code_of(request) {
            "late" => vec![Reply::payload(request, Duration::from_secs(3), printed("too late"))],
            _ => vec![
                Reply::payload(request, Duration::from_millis(10), printed("first")),
                Reply::payload(request, Duration::from_millis(20), printed("second")),
                Reply::raw(Duration::from_millis(30), "{not json"),
            ],
        });
        let channel = WorkerChannel::new(Arc::new(spawner), timeouts());

        assert!(channel.run("late").await.is_err());
        let result = channel.run("twice").await.unwrap();
        assert_eq!(result.output(), Some("first"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(channel.dropped_responses(), 3);
        assert_eq!(channel.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_version_is_dropped() {
        let spawner = ScriptedSpawner::new(|request| {
            let raw = format!(
                r#"{{"id":"{}","version":99,"kind":"run","result":{{"status":"success"}}}}"#,
                request.id
            );
            vec![Reply::raw(Duration::from_millis(5), &raw)]
        });
        let channel = WorkerChannel::new(Arc::new(spawner), timeouts());

        assert!(matches!(
            channel.run("1").await,
            Err(ChannelError::Timeout { .. })
        ));
        assert_eq!(channel.dropped_responses(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn mount_timeout_resolves_successfully() {
        let channel = WorkerChannel::new(Arc::new(ScriptedSpawner::silent()), timeouts());
        let started = tokio::time::Instant::now();

        channel
            .mount_files(vec![MountedFile::new("data.csv", b"a\n".to_vec())])
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn mount_ack_and_fault_are_surfaced() {
        let spawner = ScriptedSpawner::new(|request| {
            let payload = match &request.payload {
                RequestPayload::Mount(files) => ResponsePayload::Mount(MountAck {
                    mounted: files.iter().map(|file| file.name.clone()).collect(),
                }),
                RequestPayload::Run(_) => ResponsePayload::Fault(WorkerFault::new(
                    FaultReason::Initialization,
                    "no interpreter",
                )),
            };
            vec![Reply::payload(request, Duration::from_millis(1), payload)]
        });
        let channel = WorkerChannel::new(Arc::new(spawner), timeouts());

        channel
            .mount_files(vec![MountedFile::new("data.csv", Vec::new())])
            .await
            .unwrap();
        let err = channel.run("1").await.unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Worker(WorkerFault { reason: FaultReason::Initialization, .. })
        ));
        assert!(!err.is_transport());
    }

    #[tokio::test(start_paused = true)]
    async fn worker_is_spawned_once() {
        let spawner = Arc::new(ScriptedSpawner::new(|request| {
            vec![Reply::payload(request, Duration::ZERO, printed("ok"))]
        }));
        let channel = WorkerChannel::new(spawner.clone(), timeouts());

        for _ in 0..3 {
            channel.run("1").await.unwrap();
        }
        assert_eq!(spawner.spawn_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_link_reports_disconnect() {
        let channel = WorkerChannel::new(Arc::new(ScriptedSpawner::disconnected()), timeouts());
        let err = channel.run("1").await.unwrap_err();
        assert!(matches!(err, ChannelError::Disconnected));
        assert_eq!(channel.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_request_releases_its_slot() {
        let channel = WorkerChannel::new(Arc::new(ScriptedSpawner::silent()), timeouts());

        let abandoned = tokio::time::timeout(Duration::from_millis(100), channel.run("1")).await;
        assert!(abandoned.is_err());
        assert_eq!(channel.pending_requests(), 0);
    }
}
