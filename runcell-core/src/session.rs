//! Observable execution state for one code block.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use runcell_protocol::{ExecutionResult, GeneratedFile, MountedFile};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::channel::{ChannelError, WorkerChannel};

/// How the most recent run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The worker answered; the result may still be an execution error.
    Completed(ExecutionResult),
    /// The request never got an answer (timeout, disconnect, worker fault).
    TransportFailed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub is_running: bool,
    pub has_ever_run: bool,
    pub last: Option<SessionOutcome>,
}

impl SessionState {
    fn success(&self) -> Option<&ExecutionResult> {
        match &self.last {
            Some(SessionOutcome::Completed(result)) if result.is_success() => Some(result),
            _ => None,
        }
    }

    /// Captured output of a successful run.
    pub fn output(&self) -> Option<&str> {
        self.success().and_then(ExecutionResult::output)
    }

    pub fn image(&self) -> Option<&str> {
        self.success().and_then(ExecutionResult::image)
    }

    pub fn generated_files(&self) -> &[GeneratedFile] {
        self.success()
            .map(ExecutionResult::generated_files)
            .unwrap_or_default()
    }

    pub fn return_value(&self) -> Option<&str> {
        self.success().and_then(ExecutionResult::return_value)
    }

    /// Set for execution errors and transport failures alike.
    pub fn error_message(&self) -> Option<&str> {
        match &self.last {
            Some(SessionOutcome::Completed(result)) => result.error_message(),
            Some(SessionOutcome::TransportFailed(message)) => Some(message.as_str()),
            None => None,
        }
    }
}

/// Adapts [`WorkerChannel`] requests into a [`SessionState`] stream.
///
/// Re-running before the previous run finishes is allowed; only the latest
/// run's result is published.
pub struct ExecutionSession {
    channel: Arc<WorkerChannel>,
    state: watch::Sender<SessionState>,
    generation: AtomicU64,
}

impl ExecutionSession {
    pub fn new(channel: Arc<WorkerChannel>) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            channel,
            state,
            generation: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub async fn mount_files(&self, files: Vec<MountedFile>) -> Result<(), ChannelError> {
        self.channel.mount_files(files).await
    }

    /// Runs `code` and returns the state published for it.
    pub async fn run(&self, code: impl Into<String>) -> SessionState {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_modify(|state| {
            state.is_running = true;
            state.last = None;
        });

        let outcome = match self.channel.run(code).await {
            Ok(result) => SessionOutcome::Completed(result),
            Err(err) => {
                warn!(error = %err, "run failed before producing a result");
                SessionOutcome::TransportFailed(err.to_string())
            }
        };

        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, "discarding result of a superseded run");
            return self.snapshot();
        }
        self.state.send_modify(|state| {
            state.is_running = false;
            state.has_ever_run = true;
            state.last = Some(outcome);
        });
        self.snapshot()
    }

    /// Resets to the initial state. A run still in flight is not cancelled,
    /// but its result will not be published.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(SessionState::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Reply, ScriptedSpawner};
    use pretty_assertions::assert_eq;
    use runcell_config::TimeoutsConfig;
    use runcell_protocol::{
        ExecutionFailure, ExecutionOutput, RequestPayload, ResponsePayload, WorkerRequest,
    };
    use std::time::Duration;

    fn code_of(request: &WorkerRequest) -> String {
        match &request.payload {
            RequestPayload::Run(submission) => submission.code.clone(),
            RequestPayload::Mount(_) => String::new(),
        }
    }

    fn session() -> Arc<ExecutionSession> {
        let spawner = ScriptedSpawner::new(|request| {
            let code = code_of(request);
            let (delay, result) = match code.as_str() {
                "fail" => (
                    10,
                    ExecutionResult::Error(ExecutionFailure {
                        error_message: "ValueError: boom".to_owned(),
                        output: Some("partial".to_owned()),
                        ..ExecutionFailure::default()
                    }),
                ),
                "hang" => return Vec::new(),
                "slow" => (300, output("slow")),
                other => (10, output(other)),
            };
            vec![Reply::payload(
                request,
                Duration::from_millis(delay),
                ResponsePayload::Run(result),
            )]
        });
        let channel = WorkerChannel::new(
            Arc::new(spawner),
            TimeoutsConfig {
                mount_timeout_ms: 100,
                run_timeout_secs: 1,
            },
        );
        Arc::new(ExecutionSession::new(Arc::new(channel)))
    }

    fn output(text: &str) -> ExecutionResult {
        ExecutionResult::Success(ExecutionOutput {
            output: Some(text.to_owned()),
            ..ExecutionOutput::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn success_populates_output_only() {
        let session = session();
        let state = session.run("2").await;

        assert!(!state.is_running);
        assert!(state.has_ever_run);
        assert_eq!(state.output(), Some("2"));
        assert_eq!(state.error_message(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn execution_error_populates_message_only() {
        let state = session().run("fail").await;
        assert_eq!(state.error_message(), Some("ValueError: boom"));
        assert_eq!(state.output(), None);
        assert!(state.generated_files().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_is_visible() {
        let state = session().run("hang").await;
        assert!(state.has_ever_run);
        assert!(state.error_message().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn new_run_clears_previous_result_immediately() {
        let session = session();
        session.run("first").await;
        let mut updates = session.subscribe();

        let running = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.run("slow").await }
        });
        updates.changed().await.unwrap();
        {
            let state = updates.borrow_and_update();
            assert!(state.is_running);
            assert_eq!(state.last, None);
            assert!(state.has_ever_run);
        }

        let finished = running.await.unwrap();
        assert_eq!(finished.output(), Some("slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn latest_run_wins() {
        let session = session();
        let (first, second) = tokio::join!(session.run("slow"), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            session.run("second").await
        });

        assert_eq!(second.output(), Some("second"));
        assert_eq!(first.output(), Some("second"));
        assert_eq!(session.snapshot().output(), Some("second"));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_resets_state() {
        let session = session();
        session.run("2").await;
        session.clear();
        assert_eq!(session.snapshot(), SessionState::default());
    }
}
