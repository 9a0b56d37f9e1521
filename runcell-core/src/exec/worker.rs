use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, bail};
use runcell_config::WorkerConfig;
use runcell_protocol::{
    CodeSubmission, ExecutionFailure, ExecutionOutput, ExecutionResult, FaultReason, MountAck,
    MountedFile, PROTOCOL_VERSION, RequestPayload, ResponsePayload, WorkerFault, WorkerResponse,
    json,
};
use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use super::deps::DependencyResolver;
use super::runtime::{PythonLoader, Runtime, RuntimeLoader, SandboxLayout};
use super::snapshot::{DirectorySnapshot, collect_generated};

/// Request-level failures of the worker. Errors raised by submitted code are
/// not `WorkerError`s; they come back as [`ExecutionResult::Error`].
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("sandbox runtime failed to initialize: {0}")]
    Initialization(String),

    #[error("sandbox runtime is unavailable after a failed initialization: {0}")]
    Unavailable(String),

    #[error("invalid mount name '{0}': expected a plain file name")]
    InvalidMountName(String),

    #[error("sandbox filesystem error on '{path}': {message}")]
    Filesystem { path: String, message: String },
}

impl WorkerError {
    pub fn to_fault(&self) -> WorkerFault {
        let reason = match self {
            Self::Initialization(_) | Self::Unavailable(_) => FaultReason::Initialization,
            Self::InvalidMountName(_) | Self::Filesystem { .. } => FaultReason::Filesystem,
        };
        WorkerFault::new(reason, self.to_string())
    }
}

enum RuntimeState {
    /// Not loaded yet, or relaunch pending after the runtime stopped.
    Pending,
    Ready(Box<dyn Runtime>),
    /// Initialization failed; the worker never retries.
    Failed(String),
}

/// The isolated executor. Owns the sandbox directories and the runtime, and
/// services one request at a time.
pub struct ExecutionWorker {
    config: WorkerConfig,
    loader: Arc<dyn RuntimeLoader>,
    layout: SandboxLayout,
    resolver: DependencyResolver,
    state: RuntimeState,
    // Removes the sandbox when the worker goes away, if we created it.
    _sandbox: Option<TempDir>,
}

impl ExecutionWorker {
    pub fn new(config: WorkerConfig, loader: Arc<dyn RuntimeLoader>) -> anyhow::Result<Self> {
        let (layout, sandbox) = match &config.sandbox_dir {
            Some(root) => (SandboxLayout::under(root), None),
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("runcell-")
                    .tempdir()
                    .context("failed to create sandbox directory")?;
                (SandboxLayout::under(dir.path()), Some(dir))
            }
        };
        layout.create_dirs()?;
        let resolver = DependencyResolver::new(&config, layout.site_packages.clone());
        debug!(workspace = %layout.workspace.display(), "sandbox prepared");

        Ok(Self {
            config,
            loader,
            layout,
            resolver,
            state: RuntimeState::Pending,
            _sandbox: sandbox,
        })
    }

    /// A worker backed by the configured Python interpreter.
    pub fn with_python(config: WorkerConfig) -> anyhow::Result<Self> {
        let loader = Arc::new(PythonLoader::from_config(&config));
        Self::new(config, loader)
    }

    pub fn layout(&self) -> &SandboxLayout {
        &self.layout
    }

    pub fn workspace(&self) -> &Path {
        &self.layout.workspace
    }

    /// Loads the runtime and the baseline modules if that has not happened
    /// yet. The first failure is returned to its caller and is permanent.
    pub async fn initialize(&mut self) -> Result<(), WorkerError> {
        match &self.state {
            RuntimeState::Ready(_) => return Ok(()),
            RuntimeState::Failed(reason) => return Err(WorkerError::Unavailable(reason.clone())),
            RuntimeState::Pending => {}
        }

        let started = Instant::now();
        let loaded = load_runtime(
            self.loader.as_ref(),
            &self.layout,
            &self.resolver,
            &self.config.baseline_modules,
        )
        .await;
        match loaded {
            Ok(runtime) => {
                info!(elapsed = ?started.elapsed(), "sandbox runtime initialized");
                self.state = RuntimeState::Ready(runtime);
                Ok(())
            }
            Err(err) => {
                let reason = format!("{err:#}");
                error!(error = %reason, "sandbox runtime failed to initialize");
                self.state = RuntimeState::Failed(reason.clone());
                Err(WorkerError::Initialization(reason))
            }
        }
    }

    /// Writes each file into the sandbox root, overwriting silently.
    pub async fn mount_files(&mut self, files: &[MountedFile]) -> Result<MountAck, WorkerError> {
        let mut mounted = Vec::with_capacity(files.len());
        for file in files {
            validate_mount_name(&file.name)?;
            let path = self.layout.workspace.join(&file.name);
            tokio::fs::write(&path, &file.bytes)
                .await
                .map_err(|err| WorkerError::Filesystem {
                    path: file.name.clone(),
                    message: err.to_string(),
                })?;
            debug!(file = %file.name, bytes = file.bytes.len(), "mounted file");
            mounted.push(file.name.clone());
        }
        Ok(MountAck { mounted })
    }

    /// Executes one submission and reports its outcome.
    pub async fn run(&mut self, submission: &CodeSubmission) -> Result<ExecutionResult, WorkerError> {
        self.initialize().await?;
        let started = Instant::now();

        let before = snapshot(&self.layout.workspace).await?;
        let RuntimeState::Ready(runtime) = &mut self.state else {
            return Err(WorkerError::Unavailable("runtime is not loaded".to_owned()));
        };

        let outcome = match self.resolver.resolve_code(runtime.as_mut(), &submission.code).await {
            Ok(resolution) => {
                if !resolution.failed.is_empty() {
                    debug!(failed = ?resolution.failed, "running despite missing packages");
                }
                runtime.execute(&submission.code).await
            }
            Err(err) => Err(err),
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "sandbox runtime stopped; it will be relaunched");
                self.state = RuntimeState::Pending;
                return Ok(ExecutionResult::Error(ExecutionFailure {
                    error_message: format!("sandbox runtime stopped: {err:#}"),
                    duration_ms: elapsed_ms(started),
                    ..ExecutionFailure::default()
                }));
            }
        };

        let output = finish_output(
            &outcome.output,
            outcome.dropped_bytes,
            self.config.max_output_bytes,
        );
        let result = match outcome.error {
            // No after-snapshot: files written before the raise join the next baseline.
            Some(raised) => ExecutionResult::Error(ExecutionFailure {
                error_message: raised.message,
                output,
                traceback: raised.traceback,
                duration_ms: elapsed_ms(started),
            }),
            None => {
                let after = snapshot(&self.layout.workspace).await?;
                let generated_files = collect_generated(&self.layout.workspace, &before, &after).await;
                ExecutionResult::Success(ExecutionOutput {
                    output,
                    image: outcome.image,
                    generated_files,
                    return_value: outcome.return_value,
                    duration_ms: elapsed_ms(started),
                })
            }
        };
        debug!(
            status = result.status_str(),
            duration_ms = result.duration_ms(),
            generated = result.generated_files().len(),
            "run finished"
        );
        Ok(result)
    }

    /// Services requests strictly one at a time until the channel side hangs up.
    pub async fn serve(mut self, mut inbound: UnboundedReceiver<String>, outbound: UnboundedSender<String>) {
        while let Some(raw) = inbound.recv().await {
            let Some(response) = self.handle(&raw).await else {
                continue;
            };
            match json::encode_response(&response) {
                Ok(encoded) => {
                    if outbound.send(encoded).is_err() {
                        break;
                    }
                }
                Err(err) => error!(request_id = %response.id, error = %err, "failed to encode response"),
            }
        }
        debug!("execution worker stopped");
    }

    async fn handle(&mut self, raw: &str) -> Option<WorkerResponse> {
        let header = match json::decode_header(raw) {
            Ok(header) => header,
            Err(err) => {
                warn!(error = %err, "discarding request without a readable envelope");
                return None;
            }
        };
        if header.version != PROTOCOL_VERSION {
            error!(
                request_id = %header.id,
                received = header.version,
                expected = PROTOCOL_VERSION,
                "protocol version mismatch"
            );
            return Some(WorkerResponse::fault(
                header.id,
                FaultReason::VersionMismatch,
                format!(
                    "worker speaks protocol version {PROTOCOL_VERSION}, request used {}",
                    header.version
                ),
            ));
        }

        let request = match json::decode_request(raw) {
            Ok(request) => request,
            Err(err) => {
                warn!(request_id = %header.id, error = %err, "malformed request");
                return Some(WorkerResponse::fault(
                    header.id,
                    FaultReason::MalformedRequest,
                    err.to_string(),
                ));
            }
        };

        debug!(request_id = %request.id, kind = %request.payload.kind(), "request received");
        let payload = match request.payload {
            RequestPayload::Mount(files) => match self.mount_files(&files).await {
                Ok(ack) => ResponsePayload::Mount(ack),
                Err(err) => ResponsePayload::Fault(err.to_fault()),
            },
            RequestPayload::Run(submission) => match self.run(&submission).await {
                Ok(result) => ResponsePayload::Run(result),
                Err(err) => ResponsePayload::Fault(err.to_fault()),
            },
        };
        Some(WorkerResponse::new(request.id, payload))
    }
}

async fn load_runtime(
    loader: &dyn RuntimeLoader,
    layout: &SandboxLayout,
    resolver: &DependencyResolver,
    baseline: &[String],
) -> anyhow::Result<Box<dyn Runtime>> {
    let mut runtime = loader.load(layout).await?;
    if !baseline.is_empty() {
        let resolution = resolver.ensure_modules(runtime.as_mut(), baseline).await?;
        if !resolution.failed.is_empty() {
            bail!(
                "failed to install baseline packages: {}",
                resolution.failed.join(", ")
            );
        }
        runtime.preload(baseline).await?;
    }
    Ok(runtime)
}

async fn snapshot(workspace: &Path) -> Result<DirectorySnapshot, WorkerError> {
    DirectorySnapshot::capture(workspace)
        .await
        .map_err(|err| WorkerError::Filesystem {
            path: workspace.display().to_string(),
            message: format!("{err:#}"),
        })
}

fn validate_mount_name(name: &str) -> Result<(), WorkerError> {
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if plain {
        Ok(())
    } else {
        Err(WorkerError::InvalidMountName(name.to_owned()))
    }
}

/// Trims trailing newlines, maps an empty capture to `None` and truncates
/// at a char boundary no later than `limit` bytes. `dropped` counts bytes the
/// runtime already discarded after the end of `raw`.
fn finish_output(raw: &str, dropped: usize, limit: usize) -> Option<String> {
    let trimmed = if dropped == 0 {
        raw.trim_end_matches(['\n', '\r'])
    } else {
        raw
    };
    if trimmed.is_empty() && dropped == 0 {
        return None;
    }
    let total = trimmed.len().saturating_add(dropped);
    if total <= limit {
        return Some(trimmed.to_owned());
    }

    let mut cut = limit.min(trimmed.len());
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    let kept = trimmed.get(..cut).unwrap_or_default();
    Some(format!("{kept}\n[output truncated: showing {cut} of {total} bytes]"))
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
