//! Configuration for the runcell execution sandbox.
//!
//! The effective configuration is assembled from TOML layers (user home,
//! then workspace or an explicit file) by [`loader::ConfigManager`]. Every
//! field has a serde default so an empty file, or no file at all, yields a
//! working setup.

pub mod auto_run;
pub mod constants;
pub mod logging;
pub mod loader;
pub mod timeouts;
pub mod worker;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub use auto_run::AutoRunConfig;
pub use loader::{ConfigLayerSource, ConfigManager, merge_toml_values};
pub use logging::{LoggingConfig, TraceLevel};
pub use timeouts::TimeoutsConfig;
pub use worker::WorkerConfig;

/// Root of `runcell.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuncellConfig {
    pub worker: WorkerConfig,
    pub timeouts: TimeoutsConfig,
    pub auto_run: AutoRunConfig,
    pub logging: LoggingConfig,
}

impl RuncellConfig {
    pub fn validate(&self) -> Result<()> {
        self.worker.validate().context("invalid [worker] section")?;
        self.timeouts.validate().context("invalid [timeouts] section")?;
        self.auto_run.validate().context("invalid [auto_run] section")?;
        Ok(())
    }

    /// Render the configuration back to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize configuration")
    }
}
