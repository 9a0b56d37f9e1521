//! Bounded one-shot subprocess execution.
//!
//! Used for helper commands that run to completion (package installs),
//! as opposed to the long-lived runtime process.

use std::pin::Pin;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use async_process::{Child, Command, ExitStatus, Stdio};
use futures_lite::{AsyncRead, AsyncReadExt};
use tokio::time::{Sleep, sleep};

const DEFAULT_CAPTURE_LIMIT: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
    /// Per-stream capture limit; `0` selects the default.
    pub capture_limit: usize,
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub exit_status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_status.is_some_and(|status| status.success())
    }

    /// Last `max_lines` lines of stderr, for error messages.
    pub fn stderr_tail(&self, max_lines: usize) -> String {
        let text = String::from_utf8_lossy(&self.stderr);
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines.get(start..).unwrap_or_default().join("\n")
    }
}

pub struct BoundedProcess;

impl BoundedProcess {
    pub async fn run(options: ProcessOptions) -> Result<ProcessOutput> {
        if options.program.is_empty() {
            return Err(anyhow!("program cannot be empty"));
        }

        let started = Instant::now();
        let limit = if options.capture_limit == 0 {
            DEFAULT_CAPTURE_LIMIT
        } else {
            options.capture_limit
        };

        let mut command = Command::new(&options.program);
        command
            .args(&options.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().with_context(|| {
            format!(
                "failed to spawn '{}' with args {:?}",
                options.program, options.args
            )
        })?;

        let mut stdout_future = Box::pin(drain(child.stdout.take(), limit));
        let mut stderr_future = Box::pin(drain(child.stderr.take(), limit));
        let mut deadline: Option<Pin<Box<Sleep>>> =
            options.timeout.map(|budget| Box::pin(sleep(budget)));

        let mut exit_status: Option<ExitStatus> = None;
        let mut stdout: Option<Vec<u8>> = None;
        let mut stderr: Option<Vec<u8>> = None;
        let mut timed_out = false;

        while exit_status.is_none() || stdout.is_none() || stderr.is_none() {
            tokio::select! {
                status = child.status(), if exit_status.is_none() => {
                    exit_status = Some(status.context("failed to wait for child process")?);
                }
                captured = &mut stdout_future, if stdout.is_none() => {
                    stdout = Some(captured?);
                }
                captured = &mut stderr_future, if stderr.is_none() => {
                    stderr = Some(captured?);
                }
                () = wait_for(&mut deadline), if deadline.is_some() => {
                    timed_out = true;
                    break;
                }
            }
        }

        if timed_out {
            terminate(&mut child);
            exit_status = child.status().await.ok();
        }

        Ok(ProcessOutput {
            exit_status,
            stdout: stdout.unwrap_or_default(),
            stderr: stderr.unwrap_or_default(),
            timed_out,
            duration: started.elapsed(),
        })
    }
}

async fn wait_for(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline.as_mut() {
        Some(timer) => timer.as_mut().await,
        None => futures::future::pending::<()>().await,
    }
}

fn terminate(child: &mut Child) {
    if let Err(err) = child.kill() {
        tracing::debug!(error = %err, "failed to kill timed out process");
    }
}

/// Read a stream to EOF, keeping at most `limit` bytes. Reading continues
/// past the limit so the child never blocks on a full pipe.
async fn drain<R>(reader: Option<R>, limit: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(Vec::new());
    };

    let mut captured = Vec::new();
    let mut buffer = [0u8; 4096];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        let room = limit.saturating_sub(captured.len());
        if room > 0 {
            captured.extend_from_slice(buffer.get(..read.min(room)).unwrap_or_default());
        }
    }
    Ok(captured)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_status() {
        let output = BoundedProcess::run(ProcessOptions {
            program: "sh".into(),
            args: vec!["-c".into(), "printf hello; printf oops >&2; exit 3".into()],
            ..ProcessOptions::default()
        })
        .await
        .unwrap();

        assert_eq!(output.stdout, b"hello");
        assert_eq!(output.stderr_tail(5), "oops");
        assert!(!output.success());
        assert!(!output.timed_out);
    }

    #[tokio::test]
    async fn enforces_timeout() {
        let output = BoundedProcess::run(ProcessOptions {
            program: "sh".into(),
            args: vec!["-c".into(), "sleep 5".into()],
            timeout: Some(Duration::from_millis(100)),
            ..ProcessOptions::default()
        })
        .await
        .unwrap();

        assert!(output.timed_out);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn truncates_at_capture_limit() {
        let output = BoundedProcess::run(ProcessOptions {
            program: "sh".into(),
            args: vec!["-c".into(), "printf 0123456789".into()],
            capture_limit: 4,
            ..ProcessOptions::default()
        })
        .await
        .unwrap();

        assert_eq!(output.stdout, b"0123");
    }

    #[tokio::test]
    async fn empty_program_is_rejected() {
        assert!(BoundedProcess::run(ProcessOptions::default()).await.is_err());
    }
}
