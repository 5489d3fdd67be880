//! A sandbox worker binary. The orchestrator spawns this executable per
//! job; `queuify::runner::run` speaks the child side of the protocol.
//!
//! Register it with:
//! `queue.process_sandboxed(SandboxSource::new(path_to_this_binary, "resize"), config)`

use queuify::runner;
use serde_json::json;

#[tokio::main]
async fn main() -> queuify::Result<()> {
    runner::run(|job| async move {
        let data = job.data().await;
        eprintln!("[sandbox] processing job {} with {data}", job.id());

        job.update(json!({"progress": 50})).await?;

        // Simulate the actual work.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        Ok(json!({"resized": true}))
    })
    .await
}
