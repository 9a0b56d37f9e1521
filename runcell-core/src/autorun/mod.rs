//! Runs code the assistant wrote, injects the result into its message and
//! asks the model to continue, at most once per message.

pub mod detect;
pub mod fragment;
pub mod transcript;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use runcell_config::AutoRunConfig;
use runcell_protocol::ExecutionResult;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelError, WorkerChannel};

pub use detect::{Eligibility, RESULT_MARKER, SkipReason, TriggerPolicy, extract_fenced_code};
pub use fragment::ResultFragment;
pub use transcript::{
    Attachment, ChatMessage, GenerationPipeline, InMemoryTranscript, MessageId, Role,
    TranscriptStore,
};

/// Ids of messages already picked up for automatic execution. Shared for the
/// whole process so remounting a view cannot trigger a second run.
#[derive(Debug, Default)]
pub struct ProcessedMessages {
    ids: Mutex<HashSet<MessageId>>,
}

impl ProcessedMessages {
    /// Records `id`. Returns false if it was already recorded.
    pub fn mark(&self, id: &MessageId) -> bool {
        self.ids.lock().insert(id.clone())
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.lock().contains(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoRunOutcome {
    Disabled,
    /// Empty transcript, or the model is still generating.
    Idle,
    Skipped(SkipReason),
    /// The run never produced a result. The message stays marked.
    Abandoned { message_id: MessageId, error: String },
    Executed {
        message_id: MessageId,
        result: ExecutionResult,
    },
}

pub struct AutoRunOrchestrator {
    config: AutoRunConfig,
    policy: TriggerPolicy,
    channel: Arc<WorkerChannel>,
    transcript: Arc<dyn TranscriptStore>,
    pipeline: Arc<dyn GenerationPipeline>,
    processed: Arc<ProcessedMessages>,
}

impl AutoRunOrchestrator {
    pub fn new(
        config: AutoRunConfig,
        channel: Arc<WorkerChannel>,
        transcript: Arc<dyn TranscriptStore>,
        pipeline: Arc<dyn GenerationPipeline>,
        processed: Arc<ProcessedMessages>,
    ) -> Self {
        let policy = TriggerPolicy::from_config(&config);
        Self {
            config,
            policy,
            channel,
            transcript,
            pipeline,
            processed,
        }
    }

    pub fn processed(&self) -> &ProcessedMessages {
        &self.processed
    }

    /// Evaluates the latest message and, if it qualifies, runs its code,
    /// appends the result and signals the pipeline.
    pub async fn on_transcript_changed(&self) -> AutoRunOutcome {
        if !self.config.enabled {
            return AutoRunOutcome::Disabled;
        }
        if self.transcript.is_generating().await {
            return AutoRunOutcome::Idle;
        }
        let Some(message) = self.transcript.last_message().await else {
            return AutoRunOutcome::Idle;
        };

        let code = match self.policy.evaluate(&message, &self.processed) {
            Eligibility::Eligible(code) => code,
            Eligibility::Skip(reason) => {
                debug!(message_id = %message.id, %reason, "auto-run skipped");
                return AutoRunOutcome::Skipped(reason);
            }
        };
        // Marked before dispatch so an overlapping pass sees it.
        if !self.processed.mark(&message.id) {
            return AutoRunOutcome::Skipped(SkipReason::AlreadyProcessed);
        }

        info!(message_id = %message.id, "auto-running code block");
        let result = match self.run_with_retries(&code).await {
            Ok(result) => result,
            Err(err) => {
                error!(message_id = %message.id, error = %err, "auto-run abandoned");
                return AutoRunOutcome::Abandoned {
                    message_id: message.id,
                    error: err.to_string(),
                };
            }
        };

        let fragment = ResultFragment::from_result(result.clone());
        let content = fragment.append_to(&message.content);
        if let Err(err) = self
            .transcript
            .update_message(&message.id, content, fragment.attachments)
            .await
        {
            error!(message_id = %message.id, error = %format!("{err:#}"), "failed to store execution result");
            return AutoRunOutcome::Abandoned {
                message_id: message.id,
                error: format!("{err:#}"),
            };
        }

        tokio::time::sleep(self.config.settle_delay()).await;
        if let Err(err) = self.pipeline.continue_from(&message.id).await {
            warn!(message_id = %message.id, error = %format!("{err:#}"), "failed to resume generation");
        }
        debug!(message_id = %message.id, status = result.status_str(), "auto-run finished");

        AutoRunOutcome::Executed {
            message_id: message.id,
            result,
        }
    }

    async fn run_with_retries(&self, code: &str) -> Result<ExecutionResult, ChannelError> {
        let mut attempt = 0;
        loop {
            match self.channel.run(code).await {
                Err(err) if err.is_transport() && attempt < self.config.transport_retries => {
                    attempt += 1;
                    warn!(attempt, error = %err, "auto-run transport failure; retrying");
                }
                other => return other,
            }
        }
    }

    /// Evaluates the transcript once on subscription, then again on every
    /// revision. Each pass runs on its own task, so passes may overlap; the
    /// processed set keeps them apart.
    pub fn watch(self: Arc<Self>, mut revisions: watch::Receiver<u64>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut revision = *revisions.borrow_and_update();
            loop {
                let orchestrator = Arc::clone(&self);
                tokio::spawn(async move {
                    let outcome = orchestrator.on_transcript_changed().await;
                    debug!(revision, ?outcome, "transcript change evaluated");
                });
                if revisions.changed().await.is_err() {
                    break;
                }
                revision = *revisions.borrow_and_update();
            }
        })
    }
}
