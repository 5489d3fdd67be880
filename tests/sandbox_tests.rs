mod common;

use common::MemoryStore;
use queuify::{
    CallbackServer, Engine, EngineConfig, EventKind, JobStatus, Queue, QueueEvent, QueueOptions,
    Result, SandboxSource, UpdateHandler, UpdateRegistry, UpdateRequest, UpdateResponse,
    WorkerConfig, async_trait,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

fn watch(queue: &Queue, kind: EventKind) -> mpsc::UnboundedReceiver<QueueEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    queue.on(kind, move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<QueueEvent>) -> QueueEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

fn failure_reason(event: &QueueEvent) -> String {
    match &event.detail {
        Some(Value::String(reason)) => reason.clone(),
        other => panic!("expected a string failure reason, got {other:?}"),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn overrunning_child_is_killed_and_the_job_fails() {
    let engine = Engine::start(EngineConfig::default()).await.unwrap();
    let store = Arc::new(MemoryStore::new());
    let queue = Queue::with_options(
        &engine,
        QueueOptions {
            name: "q".to_string(),
            max_execution_time: Duration::from_millis(300),
            ..Default::default()
        },
        store.clone(),
    )
    .await
    .unwrap();
    let mut failed = watch(&queue, EventKind::JobFailed);

    // `sleep 30` never speaks the protocol and outlives the deadline by
    // a wide margin.
    queue
        .process_sandboxed(
            SandboxSource::new("/bin/sleep", "30"),
            WorkerConfig::default(),
        )
        .await
        .unwrap();

    let job_id = queue.schedule(json!({"work": true})).await.unwrap();
    let event = next_event(&mut failed).await;
    assert_eq!(event.job_id.as_deref(), Some(job_id.as_str()));

    let reason = failure_reason(&event);
    assert!(
        reason.contains("max execution time"),
        "unexpected reason: {reason}"
    );
    assert_eq!(store.status_of("q", &job_id), Some(JobStatus::Failed));
    store.assert_status_list_agreement("q", &job_id);

    // The outcome must not flip once the child is gone.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.status_of("q", &job_id), Some(JobStatus::Failed));
}

#[tokio::test]
async fn unspawnable_worker_fails_the_job() {
    let engine = Engine::start(EngineConfig::default()).await.unwrap();
    let store = Arc::new(MemoryStore::new());
    let queue = Queue::new(&engine, "q", store.clone()).await.unwrap();
    let mut failed = watch(&queue, EventKind::JobFailed);

    queue
        .process_sandboxed(
            SandboxSource::new("/nonexistent/worker-binary", "handle"),
            WorkerConfig::default(),
        )
        .await
        .unwrap();

    let job_id = queue.schedule(json!(1)).await.unwrap();
    let event = next_event(&mut failed).await;
    let reason = failure_reason(&event);
    assert!(reason.contains("spawn"), "unexpected reason: {reason}");
    assert_eq!(store.status_of("q", &job_id), Some(JobStatus::Failed));
}

struct Recording {
    seen: Mutex<Vec<Value>>,
}

#[async_trait]
impl UpdateHandler for Recording {
    async fn apply(&self, data: Value) -> Result<()> {
        self.seen.lock().unwrap().push(data);
        Ok(())
    }
}

async fn write_raw_frame<T: serde::Serialize>(stream: &mut TcpStream, message: &T) {
    let body = serde_json::to_vec(message).unwrap();
    stream.write_u32(body.len() as u32).await.unwrap();
    stream.write_all(&body).await.unwrap();
    stream.flush().await.unwrap();
}

async fn read_raw_frame(stream: &mut TcpStream) -> UpdateResponse {
    let len = stream.read_u32().await.unwrap() as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn callback_server_routes_updates_to_the_registered_handler() {
    let registry = Arc::new(UpdateRegistry::new());
    let server = CallbackServer::bind(Arc::clone(&registry)).await.unwrap();

    let handler = Arc::new(Recording {
        seen: Mutex::new(Vec::new()),
    });
    registry.register("j1".to_string(), handler.clone()).await;

    let address = server.address();
    let mut stream = TcpStream::connect((address.host.as_str(), address.port))
        .await
        .unwrap();

    write_raw_frame(
        &mut stream,
        &UpdateRequest {
            event_id: "e1".to_string(),
            job_id: "j1".to_string(),
            action: "update".to_string(),
            data: json!({"progress": 40}),
        },
    )
    .await;
    let response = read_raw_frame(&mut stream).await;
    assert_eq!(response.event_id, "e1");
    assert!(response.error_message.is_none());
    assert_eq!(
        handler.seen.lock().unwrap().as_slice(),
        &[json!({"progress": 40})]
    );

    // Same connection, job nobody registered.
    write_raw_frame(
        &mut stream,
        &UpdateRequest {
            event_id: "e2".to_string(),
            job_id: "ghost".to_string(),
            action: "update".to_string(),
            data: json!({}),
        },
    )
    .await;
    let response = read_raw_frame(&mut stream).await;
    assert_eq!(response.event_id, "e2");
    let message = response.error_message.expect("expected an error");
    assert!(message.contains("ghost"), "unexpected message: {message}");
}

#[tokio::test]
async fn callback_server_rejects_unknown_actions() {
    let registry = Arc::new(UpdateRegistry::new());
    let server = CallbackServer::bind(Arc::clone(&registry)).await.unwrap();

    let address = server.address();
    let mut stream = TcpStream::connect((address.host.as_str(), address.port))
        .await
        .unwrap();

    write_raw_frame(
        &mut stream,
        &UpdateRequest {
            event_id: "e1".to_string(),
            job_id: "j1".to_string(),
            action: "promote".to_string(),
            data: json!({}),
        },
    )
    .await;
    let response = read_raw_frame(&mut stream).await;
    assert!(response
        .error_message
        .expect("expected an error")
        .contains("promote"));
}

#[tokio::test]
async fn removed_handler_no_longer_receives_updates() {
    let registry = UpdateRegistry::new();
    let handler = Arc::new(Recording {
        seen: Mutex::new(Vec::new()),
    });
    registry.register("j1".to_string(), handler.clone()).await;
    assert!(registry.get("j1").await.is_some());

    registry.remove("j1").await;
    assert!(registry.get("j1").await.is_none());
    assert!(handler.seen.lock().unwrap().is_empty());
}
