// src/runner.rs - child-side runtime for sandboxed workers
//
// A sandbox worker binary calls `run` (single entry point) or
// `run_resolver` (several exported entry points) from its `main`. The
// runtime reads the spawn payload from stdin, binds the job contract,
// executes the entry, and reports the terminal outcome on stdout.
use crate::job::merge_update;
use crate::sandbox::{
    read_frame, strip_ansi, write_frame, ControlMessage, ServerAddress, SpawnPayload,
    UpdateRequest, UpdateResponse,
};
use crate::{QueuifyError, Result};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use uuid::Uuid;

/// The job contract as seen from inside a sandbox: `id`, `data`, and
/// async `complete`, `update`, `failed`, transported back to the
/// orchestrator over the control channel and the callback server.
#[derive(Clone)]
pub struct SandboxJob {
    inner: Arc<JobInner>,
}

struct JobInner {
    id: String,
    data: Mutex<Value>,
    shared_data: Option<Value>,
    server: ServerAddress,
    max_wait: Duration,
    settled: AtomicBool,
    stdout: Mutex<tokio::io::Stdout>,
}

impl SandboxJob {
    fn new(payload: SpawnPayload) -> Self {
        Self {
            inner: Arc::new(JobInner {
                id: payload.job.id,
                data: Mutex::new(payload.job.data),
                shared_data: payload.shared_data,
                server: payload.server_address,
                max_wait: Duration::from_millis(payload.worker_source.max_wait_for_server_ms),
                settled: AtomicBool::new(false),
                stdout: Mutex::new(tokio::io::stdout()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current payload (tracks successful `update` calls).
    pub async fn data(&self) -> Value {
        self.inner.data.lock().await.clone()
    }

    /// Context the orchestrator attached at worker registration.
    pub fn shared_data(&self) -> Option<&Value> {
        self.inner.shared_data.as_ref()
    }

    /// Merges `patch` into the payload, asks the orchestrator to persist
    /// the result, and blocks until the correlated acknowledgement
    /// arrives. The local payload is only mutated on success; waiting
    /// longer than the configured maximum fails with `Timeout`.
    pub async fn update(&self, patch: Value) -> Result<()> {
        let mut data = self.inner.data.lock().await;
        let mut merged = data.clone();
        merge_update(&mut merged, patch);

        let event_id = Uuid::new_v4().to_string();
        let stream = TcpStream::connect((self.inner.server.host.as_str(), self.inner.server.port))
            .await?;
        let (mut reader, mut writer) = stream.into_split();
        write_frame(
            &mut writer,
            &UpdateRequest {
                event_id: event_id.clone(),
                job_id: self.inner.id.clone(),
                action: "update".to_string(),
                data: merged.clone(),
            },
        )
        .await?;

        let response = tokio::time::timeout(
            self.inner.max_wait,
            wait_for_response(&mut reader, &event_id),
        )
        .await
        .map_err(|_| {
            QueuifyError::Timeout(format!(
                "update acknowledgement for job \"{}\"",
                self.inner.id
            ))
        })??;

        if let Some(message) = response.error_message {
            return Err(QueuifyError::Sandbox(message));
        }
        *data = merged;
        Ok(())
    }

    /// Reports successful completion. First settlement wins; later calls
    /// and the entry function's return value are ignored.
    pub async fn complete(&self, result: Value) -> Result<()> {
        if self.inner.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.send(&ControlMessage::Completed { data: result }).await
    }

    /// Reports failure. First settlement wins.
    pub async fn failed(&self, error: impl Into<String>) -> Result<()> {
        if self.inner.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.send(&ControlMessage::Failed {
            error: Value::String(strip_ansi(&error.into())),
        })
        .await
    }

    async fn send(&self, message: &ControlMessage) -> Result<()> {
        let mut stdout = self.inner.stdout.lock().await;
        write_frame(&mut *stdout, message).await
    }
}

async fn wait_for_response<R>(reader: &mut R, event_id: &str) -> Result<UpdateResponse>
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        match read_frame::<_, UpdateResponse>(reader).await? {
            Some(response) if response.event_id == event_id => return Ok(response),
            Some(_) => continue,
            None => {
                return Err(QueuifyError::Sandbox(
                    "callback server closed the connection".to_string(),
                ))
            }
        }
    }
}

/// Boxed entry produced by a resolver.
pub type EntryFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// Runs a single-entry sandbox worker. The function-name field of the
/// spawn payload is ignored; use `run_resolver` for multi-entry binaries.
pub async fn run<F, Fut>(entry: F) -> Result<()>
where
    F: FnOnce(SandboxJob) -> Fut,
    Fut: Future<Output = Result<Value>>,
{
    let job = read_spawn_payload().await?;
    let result = entry(job.clone()).await;
    report(&job, result).await
}

/// Runs a multi-entry sandbox worker: `resolve` maps the function name
/// from the spawn payload to an entry, or `None` for unknown names.
pub async fn run_resolver<R>(resolve: R) -> Result<()>
where
    R: FnOnce(&str) -> Option<Box<dyn FnOnce(SandboxJob) -> EntryFuture + Send>>,
{
    let mut stdin = tokio::io::stdin();
    let payload: SpawnPayload = read_frame(&mut stdin)
        .await?
        .ok_or_else(|| QueuifyError::Sandbox("no spawn payload received".to_string()))?;
    let name = payload.worker_source.function_name.clone();
    let job = SandboxJob::new(payload);

    match resolve(&name) {
        Some(entry) => {
            let result = entry(job.clone()).await;
            report(&job, result).await
        }
        None => {
            job.failed(format!("unknown worker function \"{name}\""))
                .await
        }
    }
}

async fn read_spawn_payload() -> Result<SandboxJob> {
    let mut stdin = tokio::io::stdin();
    let payload: SpawnPayload = read_frame(&mut stdin)
        .await?
        .ok_or_else(|| QueuifyError::Sandbox("no spawn payload received".to_string()))?;
    Ok(SandboxJob::new(payload))
}

async fn report(job: &SandboxJob, result: Result<Value>) -> Result<()> {
    match result {
        Ok(value) => job.complete(value).await,
        Err(error) => job.failed(error.to_string()).await,
    }
}
