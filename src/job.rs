// src/job.rs
use crate::codec::encode_payload;
use crate::events::{EventKind, Events, QueueEvent};
use crate::storage::JobStore;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Lifecycle states of a job. The status field in the job record and the
/// status list holding the job id always agree; both are flipped in the
/// same atomic storage operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Stalled,
    Completed,
    Failed,
    /// Reserved. No transition produces this status.
    Retry,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Stalled => "stalled",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retry => "retry",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A claimed unit of work: id plus opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub data: Value,
}

/// Terminal result of one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum JobOutcome {
    Completed(Value),
    Failed(String),
}

/// Merges an update into the current payload. When both sides are JSON
/// objects the new keys are shallow-merged over the old ones; any other
/// combination replaces the payload outright.
pub fn merge_update(current: &mut Value, patch: Value) {
    match (current, patch) {
        (Value::Object(cur), Value::Object(new)) => {
            for (key, value) in new {
                cur.insert(key, value);
            }
        }
        (cur, patch) => *cur = patch,
    }
}

/// The per-dispatch job contract handed to embedded workers: `id`, `data`,
/// and async `complete`, `update`, `failed`, bound to the owning queue's
/// storage handle.
///
/// `complete` and `failed` settle the job immediately; whichever is called
/// first wins and the function's eventual return value is ignored by the
/// engine's automatic bookkeeping.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: String,
    queue: String,
    data: Mutex<Value>,
    compress: bool,
    store: Arc<dyn JobStore>,
    events: Arc<Events>,
    settled: AtomicBool,
}

impl JobHandle {
    pub(crate) fn new(
        job: Job,
        queue: &str,
        compress: bool,
        store: Arc<dyn JobStore>,
        events: Arc<Events>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: job.id,
                queue: queue.to_string(),
                data: Mutex::new(job.data),
                compress,
                store,
                events,
                settled: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current in-memory payload (a clone; `update` mutates the original).
    pub async fn data(&self) -> Value {
        self.inner.data.lock().await.clone()
    }

    /// Merges `patch` into the payload and persists the result. The local
    /// copy is only mutated once the store write succeeds.
    pub async fn update(&self, patch: Value) -> Result<()> {
        let mut data = self.inner.data.lock().await;
        let mut merged = data.clone();
        merge_update(&mut merged, patch);
        let payload = encode_payload(&merged, self.inner.compress)?;
        self.inner
            .store
            .update_job(&self.inner.queue, &self.inner.id, &payload)
            .await?;
        *data = merged;
        Ok(())
    }

    /// Marks the job completed. A no-op if the job is already settled.
    pub async fn complete(&self, result: Value) -> Result<()> {
        if self.inner.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner
            .store
            .complete_job(&self.inner.queue, &self.inner.id)
            .await?;
        self.inner.events.emit(QueueEvent {
            queue: self.inner.queue.clone(),
            kind: EventKind::JobCompleted,
            job_id: Some(self.inner.id.clone()),
            detail: Some(result),
        });
        Ok(())
    }

    /// Marks the job failed with `reason`. A no-op if already settled.
    pub async fn failed(&self, reason: impl Into<String>) -> Result<()> {
        if self.inner.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let reason = reason.into();
        self.inner
            .store
            .fail_job(&self.inner.queue, &self.inner.id, &reason)
            .await?;
        self.inner.events.emit(QueueEvent {
            queue: self.inner.queue.clone(),
            kind: EventKind::JobFailed,
            job_id: Some(self.inner.id.clone()),
            detail: Some(Value::String(reason)),
        });
        Ok(())
    }
}
