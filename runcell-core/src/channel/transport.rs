use std::sync::Arc;

use anyhow::{Context, Result};
use runcell_config::WorkerConfig;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::exec::{ExecutionWorker, RuntimeLoader};

/// Both directions of the message boundary to one worker. Every message is a
/// serialized envelope; nothing else crosses.
#[derive(Debug)]
pub struct WorkerLink {
    pub outbound: UnboundedSender<String>,
    pub inbound: UnboundedReceiver<String>,
}

impl WorkerLink {
    /// A connected pair: the channel side and the worker side.
    pub fn pair() -> (Self, Self) {
        let (to_worker, worker_inbound) = mpsc::unbounded_channel();
        let (to_channel, channel_inbound) = mpsc::unbounded_channel();
        (
            Self {
                outbound: to_worker,
                inbound: channel_inbound,
            },
            Self {
                outbound: to_channel,
                inbound: worker_inbound,
            },
        )
    }
}

/// Starts a worker and returns the channel side of its link.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<WorkerLink>;
}

/// Runs an [`ExecutionWorker`] on a dedicated OS thread with its own
/// single-threaded runtime. The thread exits when the link is dropped.
pub struct ThreadSpawner {
    config: WorkerConfig,
    loader: Option<Arc<dyn RuntimeLoader>>,
}

impl ThreadSpawner {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            loader: None,
        }
    }

    /// Uses `loader` instead of the configured Python interpreter.
    pub fn with_loader(config: WorkerConfig, loader: Arc<dyn RuntimeLoader>) -> Self {
        Self {
            config,
            loader: Some(loader),
        }
    }
}

impl WorkerSpawner for ThreadSpawner {
    fn spawn(&self) -> Result<WorkerLink> {
        let worker = match &self.loader {
            Some(loader) => ExecutionWorker::new(self.config.clone(), Arc::clone(loader))?,
            None => ExecutionWorker::with_python(self.config.clone())?,
        };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build worker runtime")?;

        let (channel_side, worker_side) = WorkerLink::pair();
        std::thread::Builder::new()
            .name("runcell-worker".to_owned())
            .spawn(move || {
                let WorkerLink { outbound, inbound } = worker_side;
                runtime.block_on(worker.serve(inbound, outbound));
                debug!("worker thread exiting");
            })
            .context("failed to start worker thread")?;

        Ok(channel_side)
    }
}
