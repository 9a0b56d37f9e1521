//! Tracing configuration consumed by the binary.

use serde::{Deserialize, Serialize};

use crate::constants::defaults;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl TraceLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }
}

impl std::fmt::Display for TraceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Unknown levels fall back to the default instead of failing the whole file.
impl<'de> Deserialize<'de> for TraceLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw).unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: TraceLevel,
    /// Tracing targets the level applies to.
    #[serde(default = "LoggingConfig::default_targets")]
    pub targets: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: TraceLevel::default(),
            targets: Self::default_targets(),
        }
    }
}

impl LoggingConfig {
    fn default_targets() -> Vec<String> {
        defaults::DEFAULT_TRACE_TARGETS
            .iter()
            .map(|target| (*target).to_owned())
            .collect()
    }

    /// Builds an `EnvFilter`-compatible directive string.
    pub fn filter_directive(&self) -> String {
        if self.targets.is_empty() {
            return self.level.as_str().to_owned();
        }
        self.targets
            .iter()
            .map(|target| format!("{target}={}", self.level))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_covers_each_target() {
        let config = LoggingConfig {
            level: TraceLevel::Debug,
            targets: vec!["runcell".into(), "runcell_core".into()],
        };
        assert_eq!(
            config.filter_directive(),
            "runcell=debug,runcell_core=debug"
        );
    }

    #[test]
    fn unknown_level_falls_back() {
        let config: LoggingConfig = toml::from_str("level = \"loud\"").unwrap();
        assert_eq!(config.level, TraceLevel::Warn);
    }
}
