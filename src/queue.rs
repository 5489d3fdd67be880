// src/queue.rs
use crate::engine::{Engine, QueueConfig};
use crate::events::{EventKind, QueueEvent};
use crate::sandbox::SandboxSource;
use crate::storage::JobStore;
use crate::worker::{WorkerConfig, WorkerFn, WorkerKind};
use crate::{QueuifyError, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Options for queue configuration.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub name: String,
    /// Max jobs fetched per pull, per worker.
    pub max_concurrency: usize,
    /// Wall-clock limit per sandboxed job.
    pub max_execution_time: Duration,
    /// Compress payloads behind the `lzc` marker.
    pub compress_data: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_concurrency: 1,
            max_execution_time: Duration::from_secs(30),
            compress_data: false,
        }
    }
}

impl From<&QueueOptions> for QueueConfig {
    fn from(options: &QueueOptions) -> Self {
        Self {
            max_concurrency: options.max_concurrency,
            max_execution_time: options.max_execution_time,
            compress_data: options.compress_data,
        }
    }
}

/// A named, durable channel of jobs with its own worker pool. Created on
/// first use of a name; lives until process shutdown.
pub struct Queue {
    engine: Engine,
    name: String,
}

impl Queue {
    /// Creates a queue by name, inheriting the engine's defaults.
    pub async fn new(
        engine: &Engine,
        name: impl Into<String>,
        store: Arc<dyn JobStore>,
    ) -> Result<Self> {
        let config = engine.config();
        let options = QueueOptions {
            name: name.into(),
            max_concurrency: config.default_max_concurrency,
            max_execution_time: config.default_max_execution_time,
            compress_data: config.default_compress_data,
        };
        Self::with_options(engine, options, store).await
    }

    /// Creates a queue from full options.
    pub async fn with_options(
        engine: &Engine,
        options: QueueOptions,
        store: Arc<dyn JobStore>,
    ) -> Result<Self> {
        if options.name.is_empty() {
            return Err(QueuifyError::Config("queue name is required".to_string()));
        }
        if options.max_concurrency == 0 {
            return Err(QueuifyError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        engine
            .register_queue(&options.name, store, QueueConfig::from(&options))
            .await?;
        Ok(Self {
            engine: engine.clone(),
            name: options.name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues a job under a generated id and returns that id.
    pub async fn schedule(&self, data: Value) -> Result<String> {
        self.schedule_with_id(Uuid::new_v4().to_string(), data).await
    }

    /// Enqueues a job under a caller-chosen id. Ids are write-once:
    /// re-using one fails with `AlreadyExists`.
    pub async fn schedule_with_id(&self, job_id: impl Into<String>, data: Value) -> Result<String> {
        let job_id = job_id.into();
        self.engine.add_job(&self.name, &job_id, &data).await?;
        Ok(job_id)
    }

    /// Registers an embedded worker running `worker` in-process.
    pub async fn process<W>(&self, worker: W) -> Result<String>
    where
        W: WorkerFn + 'static,
    {
        self.engine
            .add_worker(
                &self.name,
                WorkerKind::Embedded(Arc::new(worker)),
                WorkerConfig::default(),
            )
            .await
    }

    /// Registers a sandbox worker running each job in a child process.
    pub async fn process_sandboxed(
        &self,
        source: SandboxSource,
        config: WorkerConfig,
    ) -> Result<String> {
        self.engine
            .add_worker(&self.name, WorkerKind::Sandbox(source), config)
            .await
    }

    /// Subscribes to this queue's lifecycle events.
    pub fn on(&self, kind: EventKind, handler: impl Fn(&QueueEvent) + Send + Sync + 'static) {
        self.engine.on(&self.name, kind, handler);
    }
}
