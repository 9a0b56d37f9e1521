//! Markdown injected into a message after its code ran.

use std::fmt::Write as _;

use runcell_protocol::{ExecutionFailure, ExecutionOutput, ExecutionResult, GeneratedFile};

use super::detect::RESULT_MARKER;
use super::transcript::Attachment;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFragment {
    pub markdown: String,
    pub attachments: Vec<Attachment>,
}

impl ResultFragment {
    pub fn from_result(result: ExecutionResult) -> Self {
        match result {
            ExecutionResult::Success(success) => Self::success(success),
            ExecutionResult::Error(failure) => Self::failure(&failure),
        }
    }

    fn success(success: ExecutionOutput) -> Self {
        let mut markdown = header("Execution result");
        match success.output.as_deref() {
            Some(output) => push_block(&mut markdown, "output", output),
            None if success.image.is_none() && success.generated_files.is_empty() => {
                markdown.push_str("_No output._\n");
            }
            None => {}
        }
        if let Some(value) = &success.return_value {
            let _ = writeln!(markdown, "\nReturn value: `{}`", value.replace('`', "'"));
        }
        if let Some(image) = &success.image {
            let _ = writeln!(markdown, "\n![Execution output](data:image/png;base64,{image})");
        }
        if !success.generated_files.is_empty() {
            markdown.push_str("\nGenerated files:\n");
            for file in &success.generated_files {
                push_file_line(&mut markdown, file);
            }
        }

        Self {
            markdown,
            attachments: success.generated_files.into_iter().map(Attachment::from).collect(),
        }
    }

    fn failure(failure: &ExecutionFailure) -> Self {
        let mut markdown = header("Execution error");
        if let Some(output) = failure.output.as_deref() {
            push_block(&mut markdown, "output", output);
            markdown.push('\n');
        }
        push_block(&mut markdown, "error", &failure.error_message);
        Self {
            markdown,
            attachments: Vec::new(),
        }
    }

    /// `content` followed by this fragment. The original text is kept.
    pub fn append_to(&self, content: &str) -> String {
        let original = content.trim_end();
        if original.is_empty() {
            return self.markdown.clone();
        }
        format!("{original}\n\n{}", self.markdown)
    }
}

fn header(title: &str) -> String {
    format!("{RESULT_MARKER}\n**{title}**\n\n")
}

fn push_block(markdown: &mut String, info: &str, body: &str) {
    let fence = "`".repeat(longest_backtick_run(body).max(2) + 1);
    let _ = writeln!(markdown, "{fence}{info}\n{body}\n{fence}");
}

fn push_file_line(markdown: &mut String, file: &GeneratedFile) {
    let _ = writeln!(
        markdown,
        "- `{}` ({}, {} bytes)",
        file.name,
        file.mime_type,
        file.len()
    );
}

fn longest_backtick_run(text: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    for c in text.chars() {
        if c == '`' {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}
