//! Language runtimes hosted by the execution worker.
//!
//! The shipped runtime is a long-lived Python process running an embedded
//! driver. The worker talks to it with one JSON object per line: a request
//! `{"op": ...}` is always answered by exactly one reply `{"ok": ...}`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use runcell_config::WorkerConfig;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

const DRIVER_SOURCE: &str = include_str!("driver.py");

/// Environment variable through which the driver learns the install target.
pub const SITE_DIR_ENV: &str = "RUNCELL_SITE_DIR";

/// Directories owned by one execution worker.
#[derive(Debug, Clone)]
pub struct SandboxLayout {
    /// Sandbox filesystem root and the runtime's working directory.
    pub workspace: PathBuf,
    /// Private install target for on-demand packages.
    pub site_packages: PathBuf,
}

impl SandboxLayout {
    pub fn under(root: &Path) -> Self {
        Self {
            workspace: root.join("workspace"),
            site_packages: root.join("site-packages"),
        }
    }

    pub fn create_dirs(&self) -> Result<()> {
        for dir in [&self.workspace, &self.site_packages] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create sandbox directory {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Raw outcome of one execution inside the runtime, before the worker adds
/// filesystem and timing information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RuntimeOutcome {
    #[serde(default)]
    pub output: String,
    /// Output bytes the runtime discarded past its capture limit.
    #[serde(default)]
    pub dropped_bytes: usize,
    #[serde(default)]
    pub return_value: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub error: Option<RaisedError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RaisedError {
    pub message: String,
    #[serde(default)]
    pub traceback: Option<String>,
}

/// An initialized interpreter with persistent global state.
///
/// An `Err` from any method means the runtime itself is unusable; errors
/// raised by submitted code come back inside [`RuntimeOutcome::error`].
#[async_trait]
pub trait Runtime: Send {
    /// Modules from `modules` that cannot currently be imported.
    async fn probe_missing(&mut self, modules: &[String]) -> Result<Vec<String>>;

    /// Import `modules` into the runtime.
    async fn preload(&mut self, modules: &[String]) -> Result<()>;

    async fn execute(&mut self, code: &str) -> Result<RuntimeOutcome>;
}

/// Creates runtimes for a worker. Called once per (re)initialization.
#[async_trait]
pub trait RuntimeLoader: Send + Sync {
    async fn load(&self, layout: &SandboxLayout) -> Result<Box<dyn Runtime>>;
}

/// Launches [`PythonRuntime`] instances.
#[derive(Debug, Clone)]
pub struct PythonLoader {
    python: String,
    startup_timeout: Duration,
    output_limit: Option<usize>,
}

impl PythonLoader {
    pub fn new(python: impl Into<String>, startup_timeout: Duration) -> Self {
        Self {
            python: python.into(),
            startup_timeout,
            output_limit: None,
        }
    }

    /// Runtimes stop buffering a run's output after `limit` characters.
    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = Some(limit);
        self
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.python.clone(), config.init_timeout())
            .with_output_limit(config.max_output_bytes)
    }
}

#[async_trait]
impl RuntimeLoader for PythonLoader {
    async fn load(&self, layout: &SandboxLayout) -> Result<Box<dyn Runtime>> {
        let mut runtime = PythonRuntime::launch(&self.python, layout, self.startup_timeout).await?;
        runtime.output_limit = self.output_limit;
        Ok(Box::new(runtime))
    }
}

/// A `python` child process running the embedded driver.
pub struct PythonRuntime {
    stdin: ChildStdin,
    replies: Lines<BufReader<ChildStdout>>,
    output_limit: Option<usize>,
    // Held so the process is killed when the runtime is dropped.
    _child: Child,
}

impl PythonRuntime {
    pub async fn launch(python: &str, layout: &SandboxLayout, startup_timeout: Duration) -> Result<Self> {
        let interpreter = which::which(python)
            .with_context(|| format!("python interpreter '{python}' not found on PATH"))?;

        let mut child = Command::new(&interpreter)
            .arg("-u")
            .arg("-c")
            .arg(DRIVER_SOURCE)
            .current_dir(&layout.workspace)
            .env(SITE_DIR_ENV, &layout.site_packages)
            .env("MPLBACKEND", "Agg")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", interpreter.display()))?;

        let stdin = child.stdin.take().context("runtime stdin unavailable")?;
        let stdout = child.stdout.take().context("runtime stdout unavailable")?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "runcell::sandbox", "{line}");
                }
            });
        }

        let mut runtime = Self {
            stdin,
            replies: BufReader::new(stdout).lines(),
            output_limit: None,
            _child: child,
        };

        let ready = tokio::time::timeout(startup_timeout, runtime.read_reply())
            .await
            .map_err(|_| anyhow!("python runtime did not report ready within {startup_timeout:?}"))??;
        let version = ready
            .get("python")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!(
            interpreter = %interpreter.display(),
            version = %version,
            "python runtime ready"
        );
        Ok(runtime)
    }

    async fn call(&mut self, request: Value) -> Result<Value> {
        let mut line = serde_json::to_string(&request).context("failed to encode runtime request")?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .context("failed to write to python runtime")?;
        self.stdin.flush().await.context("failed to flush python runtime")?;
        self.read_reply().await
    }

    async fn read_reply(&mut self) -> Result<Value> {
        let line = self
            .replies
            .next_line()
            .await
            .context("failed to read from python runtime")?
            .ok_or_else(|| anyhow!("python runtime exited"))?;
        let reply: Value = serde_json::from_str(&line)
            .with_context(|| format!("unparseable reply from python runtime: {line}"))?;
        if reply.get("ok").and_then(Value::as_bool) != Some(true) {
            let message = reply
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown driver error");
            bail!("python runtime rejected request: {message}");
        }
        Ok(reply)
    }
}

#[async_trait]
impl Runtime for PythonRuntime {
    async fn probe_missing(&mut self, modules: &[String]) -> Result<Vec<String>> {
        if modules.is_empty() {
            return Ok(Vec::new());
        }
        let reply = self.call(json!({ "op": "probe", "modules": modules })).await?;
        let missing = reply.get("missing").cloned().unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(missing).context("malformed probe reply")
    }

    async fn preload(&mut self, modules: &[String]) -> Result<()> {
        if modules.is_empty() {
            return Ok(());
        }
        self.call(json!({ "op": "preload", "modules": modules }))
            .await
            .context("failed to import baseline modules")?;
        Ok(())
    }

    async fn execute(&mut self, code: &str) -> Result<RuntimeOutcome> {
        let request = json!({ "op": "exec", "code": code, "output_limit": self.output_limit });
        let reply = self.call(request).await?;
        serde_json::from_value(reply).context("malformed exec reply")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_keeps_packages_outside_workspace() {
        let layout = SandboxLayout::under(Path::new("/tmp/sandbox"));
        assert!(!layout.site_packages.starts_with(&layout.workspace));
        assert_eq!(layout.workspace, Path::new("/tmp/sandbox/workspace"));
    }

    #[test]
    fn outcome_decodes_driver_reply() {
        let reply = json!({
            "ok": true,
            "output": "before\n",
            "return_value": null,
            "image": null,
            "error": { "message": "ValueError: boom", "traceback": "Traceback..." }
        });
        let outcome: RuntimeOutcome = serde_json::from_value(reply).unwrap();
        assert_eq!(outcome.output, "before\n");
        assert_eq!(outcome.error.unwrap().message, "ValueError: boom");
    }

    #[tokio::test]
    async fn missing_interpreter_fails_to_load() {
        let root = tempfile::tempdir().unwrap();
        let layout = SandboxLayout::under(root.path());
        layout.create_dirs().unwrap();

        let loader = PythonLoader::new("runcell-no-such-python", Duration::from_secs(1));
        let err = loader.load(&layout).await.err().expect("load should fail");
        assert!(err.to_string().contains("not found"));
    }
}
