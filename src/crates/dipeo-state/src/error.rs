//! Error types for the state registry.

use dipeo_core::ids::ExecutionId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StateError>;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("execution '{0}' not found")]
    NotFound(ExecutionId),

    #[error("execution '{0}' already reached a terminal status")]
    AlreadyFinished(ExecutionId),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
