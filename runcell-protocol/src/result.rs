//! Structured outcome of a single run.

use serde::{Deserialize, Serialize};

use crate::files::GeneratedFile;

/// Outcome of executing one submission.
///
/// An execution error is a normal outcome, not a transport failure: the
/// worker answered, and the submitted code raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success(ExecutionOutput),
    Error(ExecutionFailure),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Combined stdout/stderr text captured during the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Base64 PNG rasterised from the plotting context, if one was open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub generated_files: Vec<GeneratedFile>,
    /// `repr` of a trailing expression, when it is not `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub error_message: String,
    /// Output captured up to the point of failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ExecutionFailure {
    pub fn new(error_message: impl Into<String>) -> Self {
        Self {
            error_message: error_message.into(),
            ..Self::default()
        }
    }
}

impl ExecutionResult {
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub const fn status_str(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Error(_) => "error",
        }
    }

    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Success(success) => success.output.as_deref(),
            Self::Error(failure) => failure.output.as_deref(),
        }
    }

    pub fn image(&self) -> Option<&str> {
        match self {
            Self::Success(success) => success.image.as_deref(),
            Self::Error(_) => None,
        }
    }

    pub fn generated_files(&self) -> &[GeneratedFile] {
        match self {
            Self::Success(success) => &success.generated_files,
            Self::Error(_) => &[],
        }
    }

    pub fn return_value(&self) -> Option<&str> {
        match self {
            Self::Success(success) => success.return_value.as_deref(),
            Self::Error(_) => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Success(_) => None,
            Self::Error(failure) => Some(failure.error_message.as_str()),
        }
    }

    pub const fn duration_ms(&self) -> u64 {
        match self {
            Self::Success(success) => success.duration_ms,
            Self::Error(failure) => failure.duration_ms,
        }
    }
}
