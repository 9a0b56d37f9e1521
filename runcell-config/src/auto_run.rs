use std::time::Duration;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use crate::constants::defaults;

/// Policy knobs for executing code blocks emitted by the assistant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoRunConfig {
    #[serde(default = "AutoRunConfig::default_enabled")]
    pub enabled: bool,

    /// Info-string of fenced blocks that are run automatically.
    #[serde(default = "AutoRunConfig::default_language")]
    pub language: String,

    /// Extra info-strings treated as the auto-run language (e.g. `py`).
    #[serde(default = "AutoRunConfig::default_aliases")]
    pub aliases: Vec<String>,

    /// Pause between persisting the result and asking for a follow-up turn.
    #[serde(default = "AutoRunConfig::default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Extra attempts after a transport timeout or disconnect. Zero means a
    /// failed auto-run is abandoned for that message.
    #[serde(default = "AutoRunConfig::default_transport_retries")]
    pub transport_retries: u32,
}

impl Default for AutoRunConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            language: Self::default_language(),
            aliases: Self::default_aliases(),
            settle_delay_ms: Self::default_settle_delay_ms(),
            transport_retries: Self::default_transport_retries(),
        }
    }
}

impl AutoRunConfig {
    const fn default_enabled() -> bool {
        true
    }

    fn default_language() -> String {
        defaults::DEFAULT_AUTO_RUN_LANGUAGE.to_owned()
    }

    fn default_aliases() -> Vec<String> {
        vec!["py".to_owned(), "python3".to_owned()]
    }

    const fn default_settle_delay_ms() -> u64 {
        defaults::DEFAULT_SETTLE_DELAY_MS
    }

    const fn default_transport_retries() -> u32 {
        defaults::DEFAULT_TRANSPORT_RETRIES
    }

    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.language.trim().is_empty(),
            "auto_run.language must not be empty"
        );
        ensure!(
            self.transport_retries <= 5,
            "auto_run.transport_retries must be at most 5"
        );
        Ok(())
    }
}
