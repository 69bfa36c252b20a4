//! The [`StateStore`] contract.
//!
//! One implementation per backend; the engine's state-store observer is the
//! single writer for an execution, so implementations only need to
//! serialise writes across executions (the SQLite backend does this with a
//! single-connection pool).

use crate::error::Result;
use crate::models::{ExecutionFilter, ExecutionState, ExecutionStatus, NodeStatus};
use async_trait::async_trait;
use dipeo_core::envelope::Envelope;
use dipeo_core::ids::{DiagramId, ExecutionId, NodeId};
use dipeo_core::usage::TokenUsage;
use serde_json::Value;
use std::collections::HashMap;

/// Envelope bodies larger than this are spilled into the message store and
/// replaced by a `{"ref": message_id}` body (64 KiB).
pub const DEFAULT_MAX_INLINE_BYTES: usize = 64 * 1024;

/// Durable store of [`ExecutionState`] rows.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create a new execution row with status `pending` and `is_active`.
    async fn create_execution(
        &self,
        id: &ExecutionId,
        diagram_id: Option<&DiagramId>,
        variables: HashMap<String, Value>,
    ) -> Result<ExecutionState>;

    /// Read a state snapshot: cache first, then the database.
    async fn get_state(&self, id: &ExecutionId) -> Result<Option<ExecutionState>>;

    /// Persist a full state. Active executions stay in the hot cache;
    /// inactive ones are evicted.
    async fn save_state(&self, state: &ExecutionState) -> Result<()>;

    /// Transition the execution status. Terminal statuses stamp `ended_at`,
    /// clear `is_active` and evict from the cache. Updating an execution
    /// that already finished fails with
    /// [`StateError::AlreadyFinished`](crate::StateError).
    async fn update_status(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<()>;

    /// Upsert a node state, applying the node lifecycle (`started_at` on
    /// running, `ended_at` on terminal, `exec_count` on each start).
    async fn update_node_status(
        &self,
        id: &ExecutionId,
        node_id: &NodeId,
        status: NodeStatus,
        error: Option<String>,
    ) -> Result<()>;

    /// Store a node's representative output envelope, spilling oversized
    /// bodies to the message store, and fold any usage into the totals.
    async fn update_node_output(
        &self,
        id: &ExecutionId,
        node_id: &NodeId,
        envelope: &Envelope,
        usage: Option<&TokenUsage>,
    ) -> Result<()>;

    /// Replace the execution's variable map.
    async fn update_variables(
        &self,
        id: &ExecutionId,
        variables: HashMap<String, Value>,
    ) -> Result<()>;

    /// Componentwise accumulation into the execution's token usage.
    async fn add_token_usage(&self, id: &ExecutionId, usage: &TokenUsage) -> Result<()>;

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionState>>;

    /// Delete executions started more than `retention_days` ago. Returns
    /// the number of rows removed.
    async fn cleanup_old(&self, retention_days: u32) -> Result<u64>;
}
