//! Deciding whether a message should be executed automatically.

use std::fmt;

use runcell_config::AutoRunConfig;

use super::ProcessedMessages;
use super::transcript::{ChatMessage, Role};

/// Marks content that already carries an injected execution result.
pub const RESULT_MARKER: &str = "<!-- runcell:execution-result -->";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotAssistant,
    StillStreaming,
    Interrupted,
    NoRunnableCode,
    AlreadyHasResult,
    AlreadyProcessed,
}

impl SkipReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotAssistant => "not_assistant",
            Self::StillStreaming => "still_streaming",
            Self::Interrupted => "interrupted",
            Self::NoRunnableCode => "no_runnable_code",
            Self::AlreadyHasResult => "already_has_result",
            Self::AlreadyProcessed => "already_processed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible(String),
    Skip(SkipReason),
}

/// The trigger condition for automatic execution.
#[derive(Debug, Clone)]
pub struct TriggerPolicy {
    languages: Vec<String>,
}

impl TriggerPolicy {
    /// `languages` are matched case-insensitively against fence info strings.
    pub fn new<I, S>(languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            languages: languages
                .into_iter()
                .map(|language| language.as_ref().trim().to_ascii_lowercase())
                .filter(|language| !language.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &AutoRunConfig) -> Self {
        Self::new(std::iter::once(&config.language).chain(config.aliases.iter()))
    }

    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    pub fn evaluate(&self, message: &ChatMessage, processed: &ProcessedMessages) -> Eligibility {
        if message.role != Role::Assistant {
            return Eligibility::Skip(SkipReason::NotAssistant);
        }
        if message.is_loading {
            return Eligibility::Skip(SkipReason::StillStreaming);
        }
        if message.interrupted {
            return Eligibility::Skip(SkipReason::Interrupted);
        }
        let Some(code) = extract_fenced_code(&message.content, &self.languages) else {
            return Eligibility::Skip(SkipReason::NoRunnableCode);
        };
        if message.content.contains(RESULT_MARKER) {
            return Eligibility::Skip(SkipReason::AlreadyHasResult);
        }
        if processed.contains(&message.id) {
            return Eligibility::Skip(SkipReason::AlreadyProcessed);
        }
        Eligibility::Eligible(code)
    }
}

struct Fence<'a> {
    marker: char,
    len: usize,
    info: &'a str,
}

fn parse_fence(line: &str) -> Option<Fence<'_>> {
    let trimmed = line.trim_start();
    let marker = trimmed.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let len = trimmed.chars().take_while(|c| *c == marker).count();
    if len < 3 {
        return None;
    }
    let info = trimmed.get(len..).unwrap_or_default().trim();
    if marker == '`' && info.contains('`') {
        return None;
    }
    Some(Fence { marker, len, info })
}

/// Body of the first closed fenced block whose language is in `languages`.
/// Blocks in other languages are skipped; an unclosed block yields nothing.
pub fn extract_fenced_code(content: &str, languages: &[String]) -> Option<String> {
    let mut lines = content.lines();
    while let Some(line) = lines.next() {
        let Some(open) = parse_fence(line) else {
            continue;
        };
        let language = open
            .info
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let wanted = languages.contains(&language);

        let mut body = Vec::new();
        let mut closed = false;
        for line in lines.by_ref() {
            if let Some(close) = parse_fence(line)
                && close.marker == open.marker
                && close.len >= open.len
                && close.info.is_empty()
            {
                closed = true;
                break;
            }
            body.push(line);
        }

        if !closed {
            return None;
        }
        if wanted {
            return Some(body.join("\n"));
        }
    }
    None
}
