use std::path::PathBuf;

use toml::Value;

use super::merge_toml_values;

/// Where a configuration layer came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigLayerSource {
    /// `~/.runcell/runcell.toml`
    User { file: PathBuf },
    /// `runcell.toml` in the workspace root.
    Workspace { file: PathBuf },
    /// A file named explicitly on the command line or via `RUNCELL_CONFIG_PATH`.
    Explicit { file: PathBuf },
}

impl ConfigLayerSource {
    pub fn file(&self) -> &PathBuf {
        match self {
            Self::User { file } | Self::Workspace { file } | Self::Explicit { file } => file,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigLayer {
    pub source: ConfigLayerSource,
    pub value: Value,
}

/// Layers ordered from lowest to highest precedence.
#[derive(Debug, Clone, Default)]
pub struct ConfigLayerStack {
    layers: Vec<ConfigLayer>,
}

impl ConfigLayerStack {
    pub fn push(&mut self, source: ConfigLayerSource, value: Value) {
        self.layers.push(ConfigLayer { source, value });
    }

    pub fn layers(&self) -> &[ConfigLayer] {
        &self.layers
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Collapse every layer into one table.
    pub fn effective(&self) -> Value {
        let mut merged = Value::Table(toml::Table::new());
        for layer in &self.layers {
            merge_toml_values(&mut merged, &layer.value);
        }
        merged
    }
}
