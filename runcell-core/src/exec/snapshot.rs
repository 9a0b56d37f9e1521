//! Sandbox root snapshots used to detect files created by a run.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use runcell_protocol::GeneratedFile;
use tracing::warn;

/// Names of the entries directly under the sandbox root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectorySnapshot {
    entries: BTreeSet<String>,
}

impl DirectorySnapshot {
    pub async fn capture(root: &Path) -> Result<Self> {
        let mut entries = BTreeSet::new();
        let mut dir = tokio::fs::read_dir(root)
            .await
            .with_context(|| format!("failed to list {}", root.display()))?;
        while let Some(entry) = dir.next_entry().await? {
            entries.insert(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(Self { entries })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains(name)
    }

    /// Names present in `self` but not in `before`, sorted.
    pub fn added_since<'a>(&'a self, before: &'a DirectorySnapshot) -> impl Iterator<Item = &'a str> {
        self.entries.difference(&before.entries).map(String::as_str)
    }
}

/// Reads every regular file that appeared under `root` between the two
/// snapshots. Directories, symlinks and unreadable entries are skipped.
pub async fn collect_generated(
    root: &Path,
    before: &DirectorySnapshot,
    after: &DirectorySnapshot,
) -> Vec<GeneratedFile> {
    let mut generated = Vec::new();
    for name in after.added_since(before) {
        let path = root.join(name);
        match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) if meta.file_type().is_file() => {}
            Ok(_) => continue,
            Err(err) => {
                warn!(file = %name, error = %err, "generated entry vanished before it was read");
                continue;
            }
        }
        match tokio::fs::read(&path).await {
            Ok(bytes) => generated.push(GeneratedFile::new(name, mime_for_name(name), bytes)),
            Err(err) => warn!(file = %name, error = %err, "failed to read generated file"),
        }
    }
    generated
}

/// MIME type guessed from the file extension.
pub fn mime_for_name(name: &str) -> &'static str {
    let extension = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "tsv" => "text/tab-separated-values",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "xml" => "application/xml",
        "yaml" | "yml" => "application/yaml",
        "py" => "text/x-python",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => "application/octet-stream",
    }
}
