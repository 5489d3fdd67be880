// src/error.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueuifyError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{entity} \"{name}\" already exists")]
    AlreadyExists { entity: &'static str, name: String },

    #[error("{entity} \"{name}\" not found")]
    NotFound { entity: &'static str, name: String },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Failed to spawn sandbox process: {0}")]
    Spawn(String),

    #[error("Sandbox transport error: {0}")]
    Sandbox(String),

    #[error("Job execution failed: {0}")]
    Execution(#[from] anyhow::Error),

    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, QueuifyError>;
