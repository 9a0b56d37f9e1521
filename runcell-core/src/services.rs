//! Process-scoped registry for the shared execution state: the processed
//! message set and the lazily started worker channel.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use runcell_config::RuncellConfig;

use crate::autorun::{AutoRunOrchestrator, GenerationPipeline, ProcessedMessages, TranscriptStore};
use crate::channel::{ThreadSpawner, WorkerChannel, WorkerSpawner};
use crate::session::ExecutionSession;

static GLOBAL: OnceCell<Arc<ExecutionServices>> = OnceCell::new();

pub struct ExecutionServices {
    config: RuncellConfig,
    spawner: Arc<dyn WorkerSpawner>,
    processed: Arc<ProcessedMessages>,
    channel: OnceCell<Arc<WorkerChannel>>,
}

impl ExecutionServices {
    /// Services backed by a worker thread running the configured interpreter.
    pub fn new(config: RuncellConfig) -> Self {
        let spawner = Arc::new(ThreadSpawner::new(config.worker.clone()));
        Self::with_spawner(config, spawner)
    }

    pub fn with_spawner(config: RuncellConfig, spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            config,
            spawner,
            processed: Arc::new(ProcessedMessages::default()),
            channel: OnceCell::new(),
        }
    }

    /// Makes `services` the process-wide instance. Fails, handing the value
    /// back, if one is already installed.
    pub fn install(services: Arc<Self>) -> Result<(), Arc<Self>> {
        GLOBAL.set(services)
    }

    pub fn global() -> Option<Arc<Self>> {
        GLOBAL.get().cloned()
    }

    pub fn config(&self) -> &RuncellConfig {
        &self.config
    }

    pub fn processed(&self) -> Arc<ProcessedMessages> {
        Arc::clone(&self.processed)
    }

    /// The shared channel. Created on first call; the worker itself starts
    /// with the first request.
    pub fn channel(&self) -> Arc<WorkerChannel> {
        let channel = self.channel.get_or_init(|| {
            Arc::new(WorkerChannel::new(
                Arc::clone(&self.spawner),
                self.config.timeouts.clone(),
            ))
        });
        Arc::clone(channel)
    }

    /// A fresh session for one code block, on the shared channel.
    pub fn session(&self) -> ExecutionSession {
        ExecutionSession::new(self.channel())
    }

    pub fn orchestrator(
        &self,
        transcript: Arc<dyn TranscriptStore>,
        pipeline: Arc<dyn GenerationPipeline>,
    ) -> AutoRunOrchestrator {
        AutoRunOrchestrator::new(
            self.config.auto_run.clone(),
            self.channel(),
            transcript,
            pipeline,
            self.processed(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autorun::{AutoRunOutcome, ChatMessage, InMemoryTranscript, MessageId, SkipReason};
    use crate::test_support::{Reply, ScriptedSpawner};
    use anyhow::Result;
    use async_trait::async_trait;
    use runcell_protocol::{ExecutionOutput, ExecutionResult, ResponsePayload};
    use std::time::Duration;

    struct NoopPipeline;

    #[async_trait]
    impl GenerationPipeline for NoopPipeline {
        async fn continue_from(&self, _id: &MessageId) -> Result<()> {
            Ok(())
        }
    }

    fn services() -> (ExecutionServices, Arc<ScriptedSpawner>) {
        let spawner = Arc::new(ScriptedSpawner::new(|request| {
            vec![Reply::payload(
                request,
                Duration::from_millis(1),
                ResponsePayload::Run(ExecutionResult::Success(ExecutionOutput::default())),
            )]
        }));
        (
            ExecutionServices::with_spawner(RuncellConfig::default(), spawner.clone()),
            spawner,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_share_one_worker() {
        let (services, spawner) = services();
        let first = services.session();
        let second = services.session();

        first.run("1").await;
        second.run("2").await;
        assert!(Arc::ptr_eq(&services.channel(), &services.channel()));
        assert_eq!(spawner.spawn_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn processed_set_outlives_orchestrators() {
        let (services, _) = services();
        let transcript = Arc::new(InMemoryTranscript::new(vec![ChatMessage::assistant(
            "a1",
            "```python\npass\n```",
        )]));
        let content_without_marker = transcript.messages();

        let first = services.orchestrator(transcript.clone(), Arc::new(NoopPipeline));
        first.on_transcript_changed().await;
        drop(first);

        // Restore the original text so only the processed set can stop a rerun.
        let restored = InMemoryTranscript::new(content_without_marker);
        let second = services.orchestrator(Arc::new(restored), Arc::new(NoopPipeline));
        assert_eq!(
            second.on_transcript_changed().await,
            AutoRunOutcome::Skipped(SkipReason::AlreadyProcessed)
        );
    }
}
