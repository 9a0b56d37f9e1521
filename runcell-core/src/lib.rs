//! Sandboxed code execution for chat transcripts.
//!
//! The pieces, leaf first:
//!
//! - [`exec::ExecutionWorker`] runs submissions in an isolated runtime with
//!   its own sandbox directory, installing missing packages on demand and
//!   reporting captured output, figures and newly written files.
//! - [`channel::WorkerChannel`] owns the single worker and turns its
//!   message stream into awaitable requests with correlation ids and
//!   timeouts.
//! - [`session::ExecutionSession`] exposes one code block's run state as a
//!   watchable value.
//! - [`autorun::AutoRunOrchestrator`] runs assistant-written code once per
//!   message, appends the result and resumes generation.
//! - [`services::ExecutionServices`] holds the process-wide shared pieces.
//!
//! ```no_run
//! use runcell_config::RuncellConfig;
//! use runcell_core::services::ExecutionServices;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let services = ExecutionServices::new(RuncellConfig::default());
//! let result = services.channel().run("print(1 + 1)").await?;
//! assert_eq!(result.output(), Some("2"));
//! # Ok(())
//! # }
//! ```

pub mod autorun;
pub mod channel;
pub mod exec;
pub mod services;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use autorun::{AutoRunOrchestrator, AutoRunOutcome, ProcessedMessages};
pub use channel::{ChannelError, WorkerChannel};
pub use exec::{ExecutionWorker, WorkerError};
pub use services::ExecutionServices;
pub use session::{ExecutionSession, SessionOutcome, SessionState};

pub use runcell_protocol::{ExecutionResult, GeneratedFile, MountedFile};
