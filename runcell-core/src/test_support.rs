//! In-process doubles for the worker boundary and the language runtime.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use runcell_protocol::{ResponsePayload, WorkerRequest, WorkerResponse, json};

use crate::channel::{WorkerLink, WorkerSpawner};
use crate::exec::{RaisedError, Runtime, RuntimeLoader, RuntimeOutcome, SandboxLayout};

/// One message the scripted worker sends back, after a delay.
pub struct Reply {
    after: Duration,
    raw: String,
}

impl Reply {
    pub fn payload(request: &WorkerRequest, after: Duration, payload: ResponsePayload) -> Self {
        let response = WorkerResponse::new(request.id.clone(), payload);
        Self {
            after,
            raw: json::encode_response(&response).unwrap(),
        }
    }

    pub fn raw(after: Duration, raw: &str) -> Self {
        Self {
            after,
            raw: raw.to_owned(),
        }
    }
}

type Responder = dyn Fn(&WorkerRequest) -> Vec<Reply> + Send + Sync;

/// Spawns a fake worker that answers each request according to a script.
/// Replies are scheduled independently, so they may arrive out of order.
pub struct ScriptedSpawner {
    responder: Arc<Responder>,
    connected: bool,
    spawns: AtomicUsize,
}

impl ScriptedSpawner {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&WorkerRequest) -> Vec<Reply> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            connected: true,
            spawns: AtomicUsize::new(0),
        }
    }

    /// A worker that reads requests and never answers.
    pub fn silent() -> Self {
        Self::new(|_| Vec::new())
    }

    /// A worker whose end of the link is already closed.
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            ..Self::silent()
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

impl WorkerSpawner for ScriptedSpawner {
    fn spawn(&self) -> Result<WorkerLink> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        let (channel_side, worker_side) = WorkerLink::pair();
        if !self.connected {
            return Ok(channel_side);
        }

        let responder = Arc::clone(&self.responder);
        tokio::spawn(async move {
            let WorkerLink {
                outbound,
                mut inbound,
            } = worker_side;
            while let Some(raw) = inbound.recv().await {
                let Ok(request) = json::decode_request(&raw) else {
                    continue;
                };
                for reply in responder(&request) {
                    let outbound = outbound.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(reply.after).await;
                        outbound.send(reply.raw).ok();
                    });
                }
            }
        });
        Ok(channel_side)
    }
}

/// Outcomes produced by [`ScriptedLoader`] runtimes.
pub type ScriptedOutcome = RuntimeOutcome;

impl RuntimeOutcome {
    pub fn printed(text: &str) -> Self {
        Self {
            output: text.to_owned(),
            ..Self::default()
        }
    }

    pub fn raising(mut self, message: &str) -> Self {
        self.error = Some(RaisedError {
            message: message.to_owned(),
            traceback: None,
        });
        self
    }
}

type Script = dyn Fn(&str, &Path) -> Result<RuntimeOutcome> + Send + Sync;

/// Loads runtimes that answer `execute` with a script. The script receives
/// the code and the sandbox workspace; returning `Err` simulates the
/// runtime process dying.
pub struct ScriptedLoader {
    script: Arc<Script>,
    failure: Option<String>,
    missing: Vec<String>,
    loads: Arc<AtomicUsize>,
}

impl ScriptedLoader {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&str, &Path) -> Result<RuntimeOutcome> + Send + Sync + 'static,
    {
        Self {
            script: Arc::new(script),
            failure: None,
            missing: Vec::new(),
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Runtimes report these modules as not importable.
    pub fn with_missing(mut self, modules: &[&str]) -> Self {
        self.missing = modules.iter().map(|module| (*module).to_owned()).collect();
        self
    }

    /// Every load fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_owned()),
            ..Self::new(|_, _| Ok(RuntimeOutcome::default()))
        }
    }

    pub fn load_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.loads)
    }
}

#[async_trait]
impl RuntimeLoader for ScriptedLoader {
    async fn load(&self, layout: &SandboxLayout) -> Result<Box<dyn Runtime>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.failure {
            return Err(anyhow!("{message}"));
        }
        Ok(Box::new(ScriptedRuntime {
            script: Arc::clone(&self.script),
            workspace: layout.workspace.clone(),
            missing: self.missing.clone(),
        }))
    }
}

struct ScriptedRuntime {
    script: Arc<Script>,
    workspace: PathBuf,
    missing: Vec<String>,
}

#[async_trait]
impl Runtime for ScriptedRuntime {
    async fn probe_missing(&mut self, modules: &[String]) -> Result<Vec<String>> {
        Ok(modules
            .iter()
            .filter(|module| self.missing.contains(module))
            .cloned()
            .collect())
    }

    async fn preload(&mut self, _modules: &[String]) -> Result<()> {
        Ok(())
    }

    async fn execute(&mut self, code: &str) -> Result<RuntimeOutcome> {
        (self.script)(code, &self.workspace)
    }
}
