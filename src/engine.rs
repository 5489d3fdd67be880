// src/engine.rs - queue engine / worker-pool orchestrator
use crate::events::{EventKind, Events, QueueEvent};
use crate::job::{Job, JobHandle, JobOutcome, JobStatus};
use crate::sandbox::{
    self, CallbackServer, GroupTerminator, ProcessTerminator, SandboxTask, UpdateRegistry,
};
use crate::storage::JobStore;
use crate::worker::{Worker, WorkerConfig, WorkerKind, WorkerStatus};
use crate::{codec, QueuifyError, Result};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Engine-wide configuration, passed once at construction. Queues created
/// by name only inherit the defaults below.
#[derive(Clone)]
pub struct EngineConfig {
    /// Default cap on jobs fetched per pull. Bounds one fetch per worker,
    /// not aggregate parallelism: with N workers the effective ceiling is
    /// N times this value.
    pub default_max_concurrency: usize,
    /// Default wall-clock limit for one sandboxed job.
    pub default_max_execution_time: Duration,
    /// Compress payloads of queues created by name only.
    pub default_compress_data: bool,
    /// Process-tree kill capability used on sandbox timeout.
    pub terminator: Arc<dyn ProcessTerminator>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_concurrency: 1,
            default_max_execution_time: Duration::from_secs(30),
            default_compress_data: false,
            terminator: Arc::new(GroupTerminator),
        }
    }
}

/// Per-queue configuration resolved by the facade.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Max jobs fetched per pull.
    pub max_concurrency: usize,
    /// Wall-clock limit per sandboxed job.
    pub max_execution_time: Duration,
    pub compress_data: bool,
}

struct QueueState {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    workers: HashMap<String, Worker>,
    /// Workers eligible for immediate dispatch on job arrival.
    idle: BTreeSet<String>,
    /// True once a stalled pull has come back empty; pulls default to
    /// pending afterwards.
    stalled_drained: bool,
    recovery_started: bool,
    /// True once the running-to-stalled move has resolved. Workers
    /// registered earlier park until then, so no pull can observe the
    /// stalled list mid-move.
    recovery_done: bool,
}

/// The orchestrator: owns every queue's in-memory worker-pool state and
/// serializes all pool mutation behind one lock. Storage calls happen
/// outside that lock, so workers' pull cycles interleave freely.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    queues: Mutex<HashMap<String, QueueState>>,
    events: Arc<Events>,
    updates: Arc<UpdateRegistry>,
    server: CallbackServer,
}

impl Engine {
    /// Starts an engine: binds the callback server sandboxed children
    /// report updates to. The engine lives until process shutdown.
    pub async fn start(config: EngineConfig) -> Result<Engine> {
        let updates = Arc::new(UpdateRegistry::new());
        let server = CallbackServer::bind(Arc::clone(&updates)).await?;
        let address = server.address();
        info!(host = %address.host, port = address.port, "queue engine started");

        Ok(Engine {
            inner: Arc::new(EngineInner {
                config,
                queues: Mutex::new(HashMap::new()),
                events: Arc::new(Events::new()),
                updates,
                server,
            }),
        })
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Subscribes a handler to one queue's events of one kind.
    pub fn on(
        &self,
        queue: &str,
        kind: EventKind,
        handler: impl Fn(&QueueEvent) + Send + Sync + 'static,
    ) {
        self.inner.events.subscribe(queue, kind, handler);
    }

    /// Registers a queue. Names are unique per engine; re-registering
    /// fails with `AlreadyExists`.
    pub async fn register_queue(
        &self,
        name: &str,
        store: Arc<dyn JobStore>,
        config: QueueConfig,
    ) -> Result<()> {
        {
            let mut queues = self.inner.queues.lock().await;
            if queues.contains_key(name) {
                return Err(QueuifyError::AlreadyExists {
                    entity: "queue",
                    name: name.to_string(),
                });
            }
            queues.insert(
                name.to_string(),
                QueueState {
                    store,
                    config,
                    workers: HashMap::new(),
                    idle: BTreeSet::new(),
                    stalled_drained: false,
                    recovery_started: false,
                    recovery_done: false,
                },
            );
        }
        self.inner.events.emit(QueueEvent {
            queue: name.to_string(),
            kind: EventKind::QueueAdded,
            job_id: None,
            detail: None,
        });
        Ok(())
    }

    /// Persists a new job and wakes exactly one idle worker, if any.
    /// Duplicate job ids are rejected, never overwritten.
    pub async fn add_job(&self, queue: &str, job_id: &str, data: &Value) -> Result<()> {
        let (store, compress) = {
            let queues = self.inner.queues.lock().await;
            let state = queues.get(queue).ok_or_else(|| QueuifyError::NotFound {
                entity: "queue",
                name: queue.to_string(),
            })?;
            (Arc::clone(&state.store), state.config.compress_data)
        };

        let payload = codec::encode_payload(data, compress)?;
        store.add_job(queue, job_id, &payload).await?;
        self.inner.events.emit(QueueEvent {
            queue: queue.to_string(),
            kind: EventKind::JobAdded,
            job_id: Some(job_id.to_string()),
            detail: None,
        });

        let woken = {
            let mut queues = self.inner.queues.lock().await;
            match queues.get_mut(queue) {
                Some(state) => state.idle.pop_first(),
                None => None,
            }
        };
        if let Some(worker_id) = woken {
            let engine = self.clone();
            let queue = queue.to_string();
            tokio::spawn(async move { engine.worker_request(&queue, &worker_id).await });
        }
        Ok(())
    }

    /// Registers a worker and starts its pull cycle. The first worker of
    /// a queue triggers stall recovery before any job is dispatched: ids
    /// found in `running` are treated as stalled wholesale, with no
    /// liveness check behind the heuristic. Workers registered while
    /// recovery is still in flight park until it resolves.
    pub async fn add_worker(
        &self,
        queue: &str,
        kind: WorkerKind,
        config: WorkerConfig,
    ) -> Result<String> {
        let worker_id = format!("worker-{}", Uuid::new_v4());
        let (run_recovery, store) = {
            let mut queues = self.inner.queues.lock().await;
            let state = queues.get_mut(queue).ok_or_else(|| QueuifyError::NotFound {
                entity: "queue",
                name: queue.to_string(),
            })?;
            state
                .workers
                .insert(worker_id.clone(), Worker::new(kind, config));
            let first = !state.recovery_started;
            state.recovery_started = true;
            (first, Arc::clone(&state.store))
        };

        if run_recovery {
            let outcome = store
                .move_jobs_between_lists(queue, JobStatus::Running, JobStatus::Stalled)
                .await;
            let woken = {
                let mut queues = self.inner.queues.lock().await;
                match queues.get_mut(queue) {
                    Some(state) => {
                        state.recovery_done = true;
                        match &outcome {
                            Ok(moved) if moved.is_empty() => state.stalled_drained = true,
                            Ok(moved) => {
                                info!(queue, count = moved.len(), "recovered stalled jobs")
                            }
                            // Leave stalled_drained unset: the first
                            // empty stalled pull flips it.
                            Err(error) => warn!(queue, %error, "stall recovery failed"),
                        }
                        std::mem::take(&mut state.idle)
                    }
                    None => BTreeSet::new(),
                }
            };
            for waiting in woken {
                let engine = self.clone();
                let queue = queue.to_string();
                tokio::spawn(async move { engine.worker_request(&queue, &waiting).await });
            }
        }

        self.inner.events.emit(QueueEvent {
            queue: queue.to_string(),
            kind: EventKind::WorkerAdded,
            job_id: None,
            detail: None,
        });

        let engine = self.clone();
        let queue = queue.to_string();
        let id = worker_id.clone();
        tokio::spawn(async move { engine.worker_request(&queue, &id).await });
        Ok(worker_id)
    }

    /// One worker asking for work. Pull priority is stalled before
    /// pending until the stalled backlog has drained once. Unknown queue
    /// or worker is ignored: these calls may race with teardown.
    ///
    /// Boxed because the pull cycle re-enters itself through
    /// `job_finished`.
    fn worker_request<'a>(
        &'a self,
        queue: &'a str,
        worker_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            loop {
                let (store, from, limit) = {
                    let mut queues = self.inner.queues.lock().await;
                    let Some(state) = queues.get_mut(queue) else {
                        return;
                    };
                    if !state.workers.contains_key(worker_id) {
                        return;
                    }
                    if !state.recovery_done {
                        // Pulling while recovery is still moving ids
                        // would mark the stalled list drained too early.
                        // Recovery completion wakes every parked worker.
                        if let Some(worker) = state.workers.get_mut(worker_id) {
                            worker.status = WorkerStatus::Idle;
                        }
                        state.idle.insert(worker_id.to_string());
                        return;
                    }
                    state.idle.remove(worker_id);
                    let from = if state.stalled_drained {
                        JobStatus::Pending
                    } else {
                        JobStatus::Stalled
                    };
                    (Arc::clone(&state.store), from, state.config.max_concurrency)
                };

                let jobs = match store.get_jobs(queue, from, limit).await {
                    Ok(jobs) => jobs,
                    Err(error) => {
                        // Claims only materialize after a successful
                        // atomic move, so nothing is left dangling here.
                        debug!(queue, worker = worker_id, %error, "job fetch failed");
                        self.park_worker(queue, worker_id).await;
                        return;
                    }
                };

                if jobs.is_empty() {
                    let retry_pending = {
                        let mut queues = self.inner.queues.lock().await;
                        match queues.get_mut(queue) {
                            Some(state) if from == JobStatus::Stalled => {
                                state.stalled_drained = true;
                                true
                            }
                            _ => false,
                        }
                    };
                    if retry_pending {
                        continue;
                    }
                    self.park_worker(queue, worker_id).await;
                    return;
                }

                {
                    let mut queues = self.inner.queues.lock().await;
                    let Some(state) = queues.get_mut(queue) else {
                        return;
                    };
                    let Some(worker) = state.workers.get_mut(worker_id) else {
                        return;
                    };
                    worker.buffer.extend(jobs);
                }
                self.worker_process(queue, worker_id).await;
                return;
            }
        })
    }

    /// One worker executing its buffer: most-recently-fetched first, each
    /// job dispatched as its own task. When the whole batch has reached a
    /// terminal outcome the worker immediately pulls again.
    async fn worker_process(&self, queue: &str, worker_id: &str) {
        let batch = {
            let mut queues = self.inner.queues.lock().await;
            let Some(state) = queues.get_mut(queue) else {
                return;
            };
            let Some(worker) = state.workers.get_mut(worker_id) else {
                return;
            };
            worker.status = WorkerStatus::Busy;
            if worker.buffer.is_empty() {
                // Raced with a concurrent drain.
                worker.status = WorkerStatus::Idle;
                state.idle.insert(worker_id.to_string());
                return;
            }
            worker.remaining = worker.buffer.len();
            let mut batch = std::mem::take(&mut worker.buffer);
            batch.reverse();
            batch
        };

        for job in batch {
            let engine = self.clone();
            let queue = queue.to_string();
            let worker_id = worker_id.to_string();
            tokio::spawn(async move { engine.dispatch(&queue, &worker_id, job).await });
        }
    }

    async fn park_worker(&self, queue: &str, worker_id: &str) {
        let mut queues = self.inner.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return;
        };
        let Some(worker) = state.workers.get_mut(worker_id) else {
            return;
        };
        worker.status = WorkerStatus::Idle;
        state.idle.insert(worker_id.to_string());
    }

    /// Runs one job to a terminal outcome. Worker-logic failures become
    /// `fail_job` plus a job-failed event; they never propagate into the
    /// orchestrator's own control flow.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn dispatch(&self, queue: &str, worker_id: &str, job: Job) {
        let snapshot = {
            let queues = self.inner.queues.lock().await;
            let Some(state) = queues.get(queue) else {
                return;
            };
            let Some(worker) = state.workers.get(worker_id) else {
                return;
            };
            (
                worker.kind.clone(),
                worker.config.shared_data.clone(),
                Arc::clone(&state.store),
                state.config.clone(),
            )
        };
        let (kind, shared_data, store, config) = snapshot;
        let job_id = job.id.clone();

        match kind {
            WorkerKind::Embedded(worker_fn) => {
                let handle = JobHandle::new(
                    job,
                    queue,
                    config.compress_data,
                    Arc::clone(&store),
                    Arc::clone(&self.inner.events),
                );
                let result = worker_fn.run(handle.clone()).await;
                // `complete`/`failed` no-op when the worker already
                // settled the job explicitly.
                let bookkeeping = match result {
                    Ok(value) => handle.complete(value).await,
                    Err(error) => handle.failed(error.to_string()).await,
                };
                if let Err(error) = bookkeeping {
                    debug!(%job_id, %error, "terminal bookkeeping failed; job stays in running for stall recovery");
                }
            }
            WorkerKind::Sandbox(source) => {
                let outcome = sandbox::run_job(SandboxTask {
                    store: Arc::clone(&store),
                    registry: Arc::clone(&self.inner.updates),
                    server: self.inner.server.address(),
                    terminator: Arc::clone(&self.inner.config.terminator),
                    queue: queue.to_string(),
                    compress: config.compress_data,
                    job,
                    source,
                    shared_data,
                    max_execution_time: config.max_execution_time,
                })
                .await;
                self.apply_outcome(queue, &store, &job_id, outcome).await;
            }
        }

        self.job_finished(queue, worker_id).await;
    }

    async fn apply_outcome(
        &self,
        queue: &str,
        store: &Arc<dyn JobStore>,
        job_id: &str,
        outcome: JobOutcome,
    ) {
        let (persisted, kind, detail) = match outcome {
            JobOutcome::Completed(value) => (
                store.complete_job(queue, job_id).await,
                EventKind::JobCompleted,
                value,
            ),
            JobOutcome::Failed(reason) => (
                store.fail_job(queue, job_id, &reason).await,
                EventKind::JobFailed,
                Value::String(reason),
            ),
        };
        // Not retried: the job stays in running and is picked up by the
        // next stall-recovery pass.
        if let Err(error) = persisted {
            debug!(queue, job_id, %error, "terminal bookkeeping failed");
            return;
        }
        self.inner.events.emit(QueueEvent {
            queue: queue.to_string(),
            kind,
            job_id: Some(job_id.to_string()),
            detail: Some(detail),
        });
    }

    /// Decrements the worker's in-flight count; the last outcome of a
    /// batch sends the worker straight back into a pull, forming a
    /// continuous loop with no polling interval.
    async fn job_finished(&self, queue: &str, worker_id: &str) {
        let requeue = {
            let mut queues = self.inner.queues.lock().await;
            let Some(state) = queues.get_mut(queue) else {
                return;
            };
            let Some(worker) = state.workers.get_mut(worker_id) else {
                return;
            };
            worker.remaining = worker.remaining.saturating_sub(1);
            if worker.remaining == 0 {
                worker.status = WorkerStatus::Idle;
                true
            } else {
                false
            }
        };
        if requeue {
            self.worker_request(queue, worker_id).await;
        }
    }
}
