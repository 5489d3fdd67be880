// src/lib.rs
//! queuify: a durable, Redis-backed job queue
//!
//! Producers enqueue opaque jobs into named queues; a pool of workers
//! pulls, executes, and reports outcomes, with at-most-one-in-flight
//! delivery per job and stall recovery for jobs left mid-execution when
//! a process dies. Workers run embedded in the orchestrator process or
//! sandboxed in isolated child processes with a hard execution deadline.

pub mod codec;
pub mod engine;
pub mod error;
pub mod events;
pub mod job;
pub mod lua;
pub mod queue;
pub mod runner;
pub mod sandbox;
pub mod storage;
pub mod worker;

pub use engine::{Engine, EngineConfig, QueueConfig};
pub use error::{QueuifyError, Result};
pub use events::{EventKind, Events, QueueEvent};
pub use job::{merge_update, Job, JobHandle, JobStatus};
pub use queue::{Queue, QueueOptions};
pub use runner::SandboxJob;
pub use sandbox::{
    CallbackServer, ControlMessage, GroupTerminator, ProcessTerminator, SandboxSource,
    ServerAddress, SpawnPayload, UpdateHandler, UpdateRegistry, UpdateRequest, UpdateResponse,
};
pub use storage::{JobStore, RedisStorage};
pub use worker::{FnWorker, WorkerConfig, WorkerFn, WorkerKind, WorkerStatus};

// Re-export commonly used types
pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
