use std::time::Duration;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use crate::constants::defaults;

/// Budgets applied by the worker channel to each request kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Best-effort wait (milliseconds) for a mount acknowledgement.
    #[serde(default = "TimeoutsConfig::default_mount_timeout_ms")]
    pub mount_timeout_ms: u64,
    /// Hard limit (seconds) for a run response.
    #[serde(default = "TimeoutsConfig::default_run_timeout_secs")]
    pub run_timeout_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            mount_timeout_ms: Self::default_mount_timeout_ms(),
            run_timeout_secs: Self::default_run_timeout_secs(),
        }
    }
}

impl TimeoutsConfig {
    const fn default_mount_timeout_ms() -> u64 {
        defaults::DEFAULT_MOUNT_TIMEOUT_MS
    }

    const fn default_run_timeout_secs() -> u64 {
        defaults::DEFAULT_RUN_TIMEOUT_SECS
    }

    pub const fn mount_timeout(&self) -> Duration {
        Duration::from_millis(self.mount_timeout_ms)
    }

    pub const fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.mount_timeout_ms > 0,
            "timeouts.mount_timeout_ms must be greater than zero"
        );
        ensure!(
            self.run_timeout_secs > 0,
            "timeouts.run_timeout_secs must be greater than zero"
        );
        ensure!(
            self.mount_timeout() < self.run_timeout(),
            "timeouts.mount_timeout_ms ({}ms) must be shorter than timeouts.run_timeout_secs ({}s)",
            self.mount_timeout_ms,
            self.run_timeout_secs
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TimeoutsConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.mount_timeout() < config.run_timeout());
    }

    #[test]
    fn mount_budget_must_be_shorter_than_run_budget() {
        let config = TimeoutsConfig {
            mount_timeout_ms: 40_000,
            run_timeout_secs: 30,
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must be shorter"));
    }
}
