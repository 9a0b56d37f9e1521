use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use super::layers::{ConfigLayerSource, ConfigLayerStack};
use crate::RuncellConfig;
use crate::constants::paths;

/// Loads, merges and validates `runcell.toml` layers.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: RuncellConfig,
    layers: ConfigLayerStack,
}

impl ConfigManager {
    /// Load from `RUNCELL_CONFIG_PATH` when set, otherwise from the user home
    /// and the given workspace.
    pub fn load(workspace: impl AsRef<Path>) -> Result<Self> {
        if let Ok(config_path) = std::env::var(paths::CONFIG_PATH_ENV) {
            let trimmed = config_path.trim();
            if !trimmed.is_empty() {
                return Self::load_from_file(trimmed).with_context(|| {
                    format!(
                        "failed to load configuration from {}={trimmed}",
                        paths::CONFIG_PATH_ENV
                    )
                });
            }
        }
        Self::load_from_workspace(workspace)
    }

    pub fn load_from_workspace(workspace: impl AsRef<Path>) -> Result<Self> {
        let workspace_file = workspace.as_ref().join(paths::CONFIG_FILE_NAME);
        Self::assemble(
            home_config_path(),
            Some(ConfigLayerSource::Workspace {
                file: workspace_file,
            }),
        )
    }

    /// Load the user layer plus one explicit file, which must exist.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = path.as_ref().to_path_buf();
        if !file.is_file() {
            anyhow::bail!("configuration file not found: {}", file.display());
        }
        Self::assemble(home_config_path(), Some(ConfigLayerSource::Explicit { file }))
    }

    pub(crate) fn assemble(
        home_file: Option<PathBuf>,
        primary: Option<ConfigLayerSource>,
    ) -> Result<Self> {
        let mut layers = ConfigLayerStack::default();

        if let Some(file) = home_file.filter(|file| file.is_file()) {
            let value = read_toml(&file)?;
            layers.push(ConfigLayerSource::User { file }, value);
        }

        if let Some(source) = primary.filter(|source| source.file().is_file()) {
            let value = read_toml(source.file())?;
            layers.push(source, value);
        }

        let config = if layers.is_empty() {
            debug!("no runcell.toml found; using defaults");
            RuncellConfig::default()
        } else {
            layers
                .effective()
                .try_into()
                .context("failed to deserialize effective configuration")?
        };

        config
            .validate()
            .context("configuration failed validation")?;

        Ok(Self { config, layers })
    }

    pub fn config(&self) -> &RuncellConfig {
        &self.config
    }

    pub fn into_config(self) -> RuncellConfig {
        self.config
    }

    pub fn layers(&self) -> &ConfigLayerStack {
        &self.layers
    }

    /// The highest-precedence file that contributed, if any.
    pub fn config_path(&self) -> Option<&Path> {
        self.layers
            .layers()
            .last()
            .map(|layer| layer.source.file().as_path())
    }
}

fn home_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(paths::HOME_CONFIG_DIR).join(paths::CONFIG_FILE_NAME))
}

fn read_toml(path: &Path) -> Result<toml::Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}
