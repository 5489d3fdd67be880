use queuify::{Engine, EngineConfig, EventKind, FnWorker, Queue, QueueOptions, RedisStorage};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> queuify::Result<()> {
    tracing_subscriber::fmt::init();

    let engine = Engine::start(EngineConfig::default()).await?;
    let store = Arc::new(RedisStorage::connect("redis://127.0.0.1:6379").await?);

    let queue = Queue::with_options(
        &engine,
        QueueOptions {
            name: "emails".to_string(),
            max_concurrency: 4,
            ..Default::default()
        },
        store,
    )
    .await?;

    queue.on(EventKind::JobCompleted, |event| {
        println!("completed {:?}: {:?}", event.job_id, event.detail);
    });
    queue.on(EventKind::JobFailed, |event| {
        println!("failed {:?}: {:?}", event.job_id, event.detail);
    });

    queue
        .process(FnWorker(|job: queuify::JobHandle| async move {
            let data = job.data().await;
            println!("sending email: {data}");
            job.update(json!({"attempted": true})).await?;
            Ok(json!({"delivered": true}))
        }))
        .await?;

    for n in 0..5 {
        queue
            .schedule(json!({"to": format!("user{n}@example.com"), "subject": "hello"}))
            .await?;
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    Ok(())
}
