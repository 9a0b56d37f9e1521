use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use crate::constants::defaults;

/// Settings for the execution worker and the runtime it hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Interpreter used to launch the sandbox runtime and the package installer.
    #[serde(default = "WorkerConfig::default_python")]
    pub python: String,

    /// Directory that holds the sandbox filesystem. A fresh temporary
    /// directory is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_dir: Option<PathBuf>,

    /// Modules imported when the runtime starts. A module that cannot be
    /// imported (even after installation) fails initialization.
    #[serde(default)]
    pub baseline_modules: Vec<String>,

    /// Install missing imports before each run.
    #[serde(default = "WorkerConfig::default_auto_install")]
    pub auto_install: bool,

    #[serde(default = "WorkerConfig::default_install_timeout_secs")]
    pub install_timeout_secs: u64,

    /// How long to wait for the runtime to report ready.
    #[serde(default = "WorkerConfig::default_init_timeout_secs")]
    pub init_timeout_secs: u64,

    /// Captured output beyond this many bytes is truncated.
    #[serde(default = "WorkerConfig::default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Module name to package name overrides, e.g. `sklearn = "scikit-learn"`.
    #[serde(default)]
    pub package_aliases: BTreeMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            python: Self::default_python(),
            sandbox_dir: None,
            baseline_modules: Vec::new(),
            auto_install: Self::default_auto_install(),
            install_timeout_secs: Self::default_install_timeout_secs(),
            init_timeout_secs: Self::default_init_timeout_secs(),
            max_output_bytes: Self::default_max_output_bytes(),
            package_aliases: BTreeMap::new(),
        }
    }
}

impl WorkerConfig {
    fn default_python() -> String {
        defaults::DEFAULT_PYTHON.to_owned()
    }

    const fn default_auto_install() -> bool {
        true
    }

    const fn default_install_timeout_secs() -> u64 {
        defaults::DEFAULT_INSTALL_TIMEOUT_SECS
    }

    const fn default_init_timeout_secs() -> u64 {
        defaults::DEFAULT_INIT_TIMEOUT_SECS
    }

    const fn default_max_output_bytes() -> usize {
        defaults::DEFAULT_MAX_OUTPUT_BYTES
    }

    pub const fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub const fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.python.trim().is_empty(),
            "worker.python must name an interpreter"
        );
        ensure!(
            self.init_timeout_secs > 0,
            "worker.init_timeout_secs must be greater than zero"
        );
        ensure!(
            self.install_timeout_secs > 0,
            "worker.install_timeout_secs must be greater than zero"
        );
        ensure!(
            self.max_output_bytes >= 1024,
            "worker.max_output_bytes must be at least 1024"
        );
        for module in &self.baseline_modules {
            ensure!(
                !module.trim().is_empty(),
                "worker.baseline_modules must not contain empty names"
            );
        }
        Ok(())
    }
}
