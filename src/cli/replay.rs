use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use runcell_config::RuncellConfig;
use runcell_core::autorun::{GenerationPipeline, InMemoryTranscript, MessageId};
use runcell_core::services::ExecutionServices;
use runcell_core::AutoRunOutcome;
use tracing::info;

use super::ReplayOptions;

/// No model is attached to a replay; the resume signal is only logged.
struct DetachedPipeline;

#[async_trait]
impl GenerationPipeline for DetachedPipeline {
    async fn continue_from(&self, id: &MessageId) -> Result<()> {
        info!(message_id = %id, "generation would resume here; no model attached");
        Ok(())
    }
}

pub async fn handle_replay_command(config: RuncellConfig, options: ReplayOptions) -> Result<()> {
    let raw = tokio::fs::read_to_string(&options.transcript)
        .await
        .with_context(|| format!("failed to read transcript {}", options.transcript.display()))?;
    let transcript = Arc::new(
        InMemoryTranscript::from_json(&raw)
            .with_context(|| format!("invalid transcript {}", options.transcript.display()))?,
    );

    let services = ExecutionServices::new(config);
    let orchestrator = services.orchestrator(transcript.clone(), Arc::new(DetachedPipeline));

    match orchestrator.on_transcript_changed().await {
        AutoRunOutcome::Disabled => eprintln!("auto-run is disabled in configuration"),
        AutoRunOutcome::Idle => eprintln!("nothing to run"),
        AutoRunOutcome::Skipped(reason) => eprintln!("auto-run skipped: {reason}"),
        AutoRunOutcome::Executed { message_id, result } => {
            eprintln!("ran message {message_id}: {}", result.status_str());
        }
        AutoRunOutcome::Abandoned { message_id, error } => {
            bail!("auto-run of message {message_id} failed: {error}")
        }
    }

    if let Some(path) = options.output.as_deref() {
        tokio::fs::write(path, transcript.to_json()?)
            .await
            .with_context(|| format!("failed to write transcript {}", path.display()))?;
    }

    let Some(last) = transcript.messages().pop() else {
        return Ok(());
    };
    if options.json {
        let rendered =
            serde_json::to_string_pretty(&last).context("failed to serialize message")?;
        println!("{rendered}");
    } else {
        println!("{}", last.content);
    }
    Ok(())
}
