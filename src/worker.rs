// src/worker.rs
use crate::sandbox::SandboxSource;
use crate::{Job, JobHandle, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Worker execution mode.
#[derive(Clone)]
pub enum WorkerKind {
    /// Runs the worker function inside the orchestrator process.
    Embedded(Arc<dyn WorkerFn>),
    /// Runs each job in an isolated child process described by the source.
    Sandbox(SandboxSource),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Busy,
}

/// Per-worker registration options.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// Context payload handed to sandboxed children via the spawn payload.
    /// Embedded workers capture their context directly instead.
    pub shared_data: Option<Value>,
}

/// Business logic of an embedded worker.
#[async_trait]
pub trait WorkerFn: Send + Sync {
    async fn run(&self, job: JobHandle) -> Result<Value>;
}

/// Adapter letting a plain async closure act as a `WorkerFn`.
pub struct FnWorker<F>(pub F);

#[async_trait]
impl<F, Fut> WorkerFn for FnWorker<F>
where
    F: Fn(JobHandle) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn run(&self, job: JobHandle) -> Result<Value> {
        (self.0)(job).await
    }
}

/// One registered worker of a queue's pool. Lives for the process
/// lifetime; the engine owns all mutation of this state.
pub(crate) struct Worker {
    pub(crate) kind: WorkerKind,
    pub(crate) config: WorkerConfig,
    pub(crate) status: WorkerStatus,
    /// Jobs claimed but not yet dispatched, drained most-recent-first.
    pub(crate) buffer: Vec<Job>,
    /// Jobs from the current batch still awaiting a terminal outcome.
    pub(crate) remaining: usize,
}

impl Worker {
    pub(crate) fn new(kind: WorkerKind, config: WorkerConfig) -> Self {
        Self {
            kind,
            config,
            status: WorkerStatus::Idle,
            buffer: Vec::new(),
            remaining: 0,
        }
    }
}
