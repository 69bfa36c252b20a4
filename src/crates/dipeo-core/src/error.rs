//! Error taxonomy for diagram execution.
//!
//! Errors carry a *kind* the engine classifies: only [`ErrorKind::Transient`]
//! is retried; everything else either fails the node or the execution
//! depending on the node's `on_error` action. [`FailureDetail`] is the
//! structured, user-visible shape; stack traces stay in server logs.

use crate::ids::NodeId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience result type using [`ExecutionError`].
pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Classification of an [`ExecutionError`], independent of its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    PermissionDenied,
    Timeout,
    Cancelled,
    /// Retryable I/O failure, 5xx, rate limit.
    Transient,
    /// Deterministic handler failure; retrying will not help.
    HandlerFailure,
    /// Internal scheduling error; must not leak out of the engine.
    DependencyUnmet,
    /// Engine-internal: ready set empty with nothing in flight.
    Deadlock,
    State,
    Serialization,
    Io,
}

/// All errors that can occur while executing a diagram.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("operation timed out after {duration_ms}ms: {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("node '{node}' failed: {message}")]
    Handler { node: NodeId, message: String },

    #[error("dependency unmet for node '{0}'")]
    DependencyUnmet(NodeId),

    #[error("deadlock: {0}")]
    Deadlock(String),

    #[error("state error: {0}")]
    State(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutionError {
    pub fn handler(node: impl Into<NodeId>, message: impl Into<String>) -> Self {
        Self::Handler {
            node: node.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::Validation(_) => ErrorKind::Validation,
            ExecutionError::NotFound(_) => ErrorKind::NotFound,
            ExecutionError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            ExecutionError::Timeout { .. } => ErrorKind::Timeout,
            ExecutionError::Cancelled(_) => ErrorKind::Cancelled,
            ExecutionError::Transient(_) => ErrorKind::Transient,
            ExecutionError::Handler { .. } => ErrorKind::HandlerFailure,
            ExecutionError::DependencyUnmet(_) => ErrorKind::DependencyUnmet,
            ExecutionError::Deadlock(_) => ErrorKind::Deadlock,
            ExecutionError::State(_) => ErrorKind::State,
            ExecutionError::Serialization(_) => ErrorKind::Serialization,
            ExecutionError::Io(_) => ErrorKind::Io,
        }
    }

    /// Only transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            ExecutionError::Handler { node, .. } | ExecutionError::DependencyUnmet(node) => {
                Some(node)
            }
            _ => None,
        }
    }
}

/// User-visible failure shape: kind, terse message, optional node context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

impl FailureDetail {
    pub fn from_error(error: &ExecutionError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            node_id: error.node_id().cloned(),
            retry_count: None,
        }
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = Some(retries);
        self
    }
}
