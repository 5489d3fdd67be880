// src/sandbox.rs - isolated child-process execution transport
use crate::codec::encode_payload;
use crate::job::JobOutcome;
use crate::storage::JobStore;
use crate::{Job, QueuifyError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Descriptor of a sandbox worker: an executable implementing the child
/// protocol plus the entry symbol it should resolve. No code is ever
/// evaluated from strings; the child binary owns symbol resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSource {
    pub module_path: PathBuf,
    pub function_name: String,
    /// How long a child-side `update` waits for its acknowledgement.
    #[serde(default = "default_max_wait")]
    pub max_wait_for_server_ms: u64,
}

fn default_max_wait() -> u64 {
    6_000
}

impl SandboxSource {
    pub fn new(module_path: impl Into<PathBuf>, function_name: impl Into<String>) -> Self {
        Self {
            module_path: module_path.into(),
            function_name: function_name.into(),
            max_wait_for_server_ms: default_max_wait(),
        }
    }
}

/// Address of the orchestrator's callback server, passed to children in
/// the spawn payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

/// First frame written to a child's stdin after spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnPayload {
    pub job: Job,
    pub server_address: ServerAddress,
    pub worker_source: SandboxSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_data: Option<Value>,
}

/// Terminal outcome reported by a child on its control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ControlMessage {
    Completed { data: Value },
    Failed { error: Value },
}

/// Mid-flight update request written by a child to the callback server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub event_id: String,
    pub job_id: String,
    pub action: String,
    pub data: Value,
}

/// Callback-server reply, correlated by `event_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResponse {
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Writes one length-delimited JSON frame.
pub(crate) async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-delimited JSON frame. Returns `None` on a clean EOF
/// at a frame boundary.
pub(crate) async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Removes terminal escape sequences (CSI, OSC, and charset escapes)
/// from child-reported error text before it travels over the control
/// channel.
pub(crate) fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' && c != '\u{9b}' {
            out.push(c);
            continue;
        }
        // OSC sequences carry free text and terminate at BEL or ST.
        if chars.peek() == Some(&']') {
            while let Some(next) = chars.next() {
                if next == '\u{7}' {
                    break;
                }
                if next == '\u{1b}' {
                    chars.next();
                    break;
                }
            }
            continue;
        }
        // Skip the introducer bytes, then parameter bytes until the
        // final byte of the sequence.
        while let Some(&next) = chars.peek() {
            if matches!(next, '[' | '(' | ')' | '#' | ';' | '?') {
                chars.next();
            } else {
                break;
            }
        }
        while let Some(next) = chars.next() {
            if ('\u{40}'..='\u{7e}').contains(&next) {
                break;
            }
        }
    }
    out
}

/// Handler invoked when a child requests a payload update for a job.
/// Registered per job id for exactly the lifetime of that job's sandbox
/// execution.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn apply(&self, data: Value) -> Result<()>;
}

/// Ephemeral job-id to update-handler correlation map.
#[derive(Default)]
pub struct UpdateRegistry {
    entries: Mutex<HashMap<String, Arc<dyn UpdateHandler>>>,
}

impl UpdateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, job_id: String, handler: Arc<dyn UpdateHandler>) {
        self.entries.lock().await.insert(job_id, handler);
    }

    pub async fn remove(&self, job_id: &str) {
        self.entries.lock().await.remove(job_id);
    }

    pub async fn get(&self, job_id: &str) -> Option<Arc<dyn UpdateHandler>> {
        self.entries.lock().await.get(job_id).cloned()
    }
}

/// Persists an updated payload through the storage layer.
pub(crate) struct PersistUpdate {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) queue: String,
    pub(crate) job_id: String,
    pub(crate) compress: bool,
}

#[async_trait]
impl UpdateHandler for PersistUpdate {
    async fn apply(&self, data: Value) -> Result<()> {
        let payload = encode_payload(&data, self.compress)?;
        self.store
            .update_job(&self.queue, &self.job_id, &payload)
            .await
    }
}

/// Long-lived local server receiving update frames from sandboxed
/// children. One per engine, bound once at engine start.
pub struct CallbackServer {
    addr: SocketAddr,
}

impl CallbackServer {
    pub async fn bind(registry: Arc<UpdateRegistry>) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        tokio::spawn(accept_loop(listener, registry));
        Ok(Self { addr })
    }

    pub fn address(&self) -> ServerAddress {
        ServerAddress {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
        }
    }
}

async fn accept_loop(listener: TcpListener, registry: Arc<UpdateRegistry>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    if let Err(error) = serve_connection(stream, registry).await {
                        debug!(%peer, %error, "callback connection closed with error");
                    }
                });
            }
            Err(error) => warn!(%error, "callback server accept failed"),
        }
    }
}

async fn serve_connection(stream: TcpStream, registry: Arc<UpdateRegistry>) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    while let Some(request) = read_frame::<_, UpdateRequest>(&mut reader).await? {
        let error_message = if request.action != "update" {
            Some(format!("unsupported action \"{}\"", request.action))
        } else {
            match registry.get(&request.job_id).await {
                None => Some(format!(
                    "no update handler registered for job \"{}\"",
                    request.job_id
                )),
                Some(handler) => handler.apply(request.data).await.err().map(|e| e.to_string()),
            }
        };
        let response = UpdateResponse {
            event_id: request.event_id,
            error_message,
        };
        write_frame(&mut writer, &response).await?;
    }
    Ok(())
}

/// Process-tree termination seam. The engine only depends on the
/// signature; swap in a platform-specific implementation as needed.
#[async_trait]
pub trait ProcessTerminator: Send + Sync {
    async fn terminate(&self, pid: u32, signal: i32) -> Result<()>;
}

/// Default terminator: signals the child's whole process group. Children
/// are spawned as group leaders, so descendants are covered too.
pub struct GroupTerminator;

#[async_trait]
impl ProcessTerminator for GroupTerminator {
    async fn terminate(&self, pid: u32, signal: i32) -> Result<()> {
        let status = Command::new("kill")
            .arg(format!("-{signal}"))
            .arg("--")
            .arg(format!("-{pid}"))
            .status()
            .await?;
        if !status.success() {
            return Err(QueuifyError::Sandbox(format!(
                "kill -{signal} of process group {pid} exited with {status}"
            )));
        }
        Ok(())
    }
}

/// Everything one sandboxed dispatch needs.
pub(crate) struct SandboxTask {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) registry: Arc<UpdateRegistry>,
    pub(crate) server: ServerAddress,
    pub(crate) terminator: Arc<dyn ProcessTerminator>,
    pub(crate) queue: String,
    pub(crate) compress: bool,
    pub(crate) job: Job,
    pub(crate) source: SandboxSource,
    pub(crate) shared_data: Option<Value>,
    pub(crate) max_execution_time: Duration,
}

/// Runs one job in a child process and returns its terminal outcome.
/// The update-handler registration lives exactly as long as the run and
/// is removed on every path out of here.
pub(crate) async fn run_job(task: SandboxTask) -> JobOutcome {
    let job_id = task.job.id.clone();
    task.registry
        .register(
            job_id.clone(),
            Arc::new(PersistUpdate {
                store: Arc::clone(&task.store),
                queue: task.queue.clone(),
                job_id: job_id.clone(),
                compress: task.compress,
            }),
        )
        .await;

    let outcome = supervise(&task)
        .await
        .unwrap_or_else(|error| JobOutcome::Failed(error.to_string()));

    task.registry.remove(&job_id).await;
    outcome
}

async fn supervise(task: &SandboxTask) -> Result<JobOutcome> {
    let mut cmd = Command::new(&task.source.module_path);
    cmd.arg(&task.source.function_name)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| QueuifyError::Spawn(e.to_string()))?;
    let pid = child.id();

    let payload = SpawnPayload {
        job: task.job.clone(),
        server_address: task.server.clone(),
        worker_source: task.source.clone(),
        shared_data: task.shared_data.clone(),
    };
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| QueuifyError::Sandbox("child stdin unavailable".to_string()))?;
    write_frame(&mut stdin, &payload).await?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| QueuifyError::Sandbox("child stdout unavailable".to_string()))?;
    let mut stdout = BufReader::new(stdout);

    // Whichever resolves first wins; the loser is dropped, so a late
    // control message can never re-apply bookkeeping.
    let outcome = tokio::select! {
        frame = read_frame::<_, ControlMessage>(&mut stdout) => {
            let outcome = match frame {
                Ok(Some(ControlMessage::Completed { data })) => JobOutcome::Completed(data),
                Ok(Some(ControlMessage::Failed { error })) => JobOutcome::Failed(error_text(&error)),
                Ok(None) => {
                    JobOutcome::Failed("sandbox process exited without reporting an outcome".to_string())
                }
                Err(error) => JobOutcome::Failed(format!("sandbox control channel failed: {error}")),
            };
            let _ = child.start_kill();
            outcome
        }
        _ = tokio::time::sleep(task.max_execution_time) => {
            if let Some(pid) = pid {
                if let Err(error) = task.terminator.terminate(pid, 9).await {
                    warn!(%error, pid, "process tree termination failed");
                }
            }
            let _ = child.start_kill();
            let _ = child.wait().await;
            JobOutcome::Failed(format!(
                "max execution time of {:?} exceeded",
                task.max_execution_time
            ))
        }
    };
    Ok(outcome)
}

fn error_text(error: &Value) -> String {
    match error {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spawn_payload_uses_camel_case_fields() {
        let payload = SpawnPayload {
            job: Job {
                id: "j1".into(),
                data: json!({"n": 1}),
            },
            server_address: ServerAddress {
                host: "127.0.0.1".into(),
                port: 4242,
            },
            worker_source: SandboxSource::new("/usr/bin/worker", "handle"),
            shared_data: None,
        };
        let encoded = serde_json::to_value(&payload).unwrap();
        assert!(encoded.get("serverAddress").is_some());
        assert!(encoded.get("workerSource").is_some());
        assert_eq!(
            encoded["workerSource"]["modulePath"],
            json!("/usr/bin/worker")
        );
        assert_eq!(encoded["workerSource"]["maxWaitForServerMs"], json!(6000));
        assert!(encoded.get("sharedData").is_none());
    }

    #[test]
    fn control_messages_are_action_tagged() {
        let completed = serde_json::to_value(ControlMessage::Completed {
            data: json!({"ok": true}),
        })
        .unwrap();
        assert_eq!(completed["action"], json!("completed"));

        let failed: ControlMessage =
            serde_json::from_value(json!({"action": "failed", "error": "boom"})).unwrap();
        assert!(matches!(failed, ControlMessage::Failed { .. }));
    }

    #[test]
    fn strip_ansi_removes_color_codes() {
        let colored = "\u{1b}[31mboom\u{1b}[0m at line \u{1b}[1;4m7\u{1b}[m";
        assert_eq!(strip_ansi(colored), "boom at line 7");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn strip_ansi_removes_osc_and_charset_sequences() {
        let titled = "\u{1b}]0;window title\u{7}boom";
        assert_eq!(strip_ansi(titled), "boom");

        let hyperlink = "\u{1b}]8;;https://example.com\u{1b}\\boom";
        assert_eq!(strip_ansi(hyperlink), "boom");

        let charset = "\u{1b}(Bboom \u{1b}[?25hcursor";
        assert_eq!(strip_ansi(charset), "boom cursor");
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let request = UpdateRequest {
            event_id: "e1".into(),
            job_id: "j1".into(),
            action: "update".into(),
            data: json!({"step": 2}),
        };
        write_frame(&mut a, &request).await.unwrap();
        let decoded: UpdateRequest = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(decoded.event_id, "e1");
        assert_eq!(decoded.data, json!({"step": 2}));

        drop(a);
        let eof: Option<UpdateRequest> = read_frame(&mut b).await.unwrap();
        assert!(eof.is_none());
    }
}
