// src/events.rs
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Lifecycle events emitted by the engine and consumed by the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    QueueAdded,
    WorkerAdded,
    JobAdded,
    JobCompleted,
    JobFailed,
}

#[derive(Debug, Clone)]
pub struct QueueEvent {
    pub queue: String,
    pub kind: EventKind,
    pub job_id: Option<String>,
    /// Completion result or failure reason, when the event carries one.
    pub detail: Option<Value>,
}

type EventHandler = Arc<dyn Fn(&QueueEvent) + Send + Sync>;

/// Per-instance subscription registry mapping queue + event kind to
/// handler lists. Replaces a process-global emitter namespace: two engines
/// in one process never see each other's events.
#[derive(Default)]
pub struct Events {
    handlers: Mutex<HashMap<(String, EventKind), Vec<EventHandler>>>,
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        queue: &str,
        kind: EventKind,
        handler: impl Fn(&QueueEvent) + Send + Sync + 'static,
    ) {
        let Ok(mut handlers) = self.handlers.lock() else {
            return;
        };
        handlers
            .entry((queue.to_string(), kind))
            .or_default()
            .push(Arc::new(handler));
    }

    /// Invokes every handler registered for the event's queue and kind.
    /// Handlers run outside the registry lock, so a handler may subscribe
    /// further handlers without deadlocking.
    pub fn emit(&self, event: QueueEvent) {
        let targets: Vec<EventHandler> = {
            let Ok(handlers) = self.handlers.lock() else {
                return;
            };
            handlers
                .get(&(event.queue.clone(), event.kind))
                .map(|list| list.to_vec())
                .unwrap_or_default()
        };
        for handler in targets {
            handler(&event);
        }
    }
}
