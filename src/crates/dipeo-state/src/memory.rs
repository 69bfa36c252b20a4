//! In-memory [`StateStore`] for tests and embedded use.

use crate::error::{Result, StateError};
use crate::message_store::{spill_large_body, MessageStore};
use crate::models::{ExecutionFilter, ExecutionState, ExecutionStatus, NodeStatus};
use crate::store::{StateStore, DEFAULT_MAX_INLINE_BYTES};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use dipeo_core::envelope::Envelope;
use dipeo_core::ids::{DiagramId, ExecutionId, NodeId};
use dipeo_core::usage::TokenUsage;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub struct InMemoryStateStore {
    states: RwLock<HashMap<ExecutionId, ExecutionState>>,
    message_store: Option<Arc<dyn MessageStore>>,
    max_inline_bytes: usize,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            message_store: None,
            max_inline_bytes: DEFAULT_MAX_INLINE_BYTES,
        }
    }

    pub fn with_message_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.message_store = Some(store);
        self
    }

    pub fn with_max_inline_bytes(mut self, bytes: usize) -> Self {
        self.max_inline_bytes = bytes;
        self
    }

    fn modify<T>(
        &self,
        id: &ExecutionId,
        f: impl FnOnce(&mut ExecutionState) -> Result<T>,
    ) -> Result<T> {
        let mut states = self.states.write();
        let state = states
            .get_mut(id)
            .ok_or_else(|| StateError::NotFound(id.clone()))?;
        f(state)
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create_execution(
        &self,
        id: &ExecutionId,
        diagram_id: Option<&DiagramId>,
        variables: HashMap<String, Value>,
    ) -> Result<ExecutionState> {
        let state = ExecutionState::new(id.clone(), diagram_id.cloned(), variables);
        self.states.write().insert(id.clone(), state.clone());
        Ok(state)
    }

    async fn get_state(&self, id: &ExecutionId) -> Result<Option<ExecutionState>> {
        Ok(self.states.read().get(id).cloned())
    }

    async fn save_state(&self, state: &ExecutionState) -> Result<()> {
        self.states.write().insert(state.id.clone(), state.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.modify(id, |state| {
            if state.status.is_terminal() {
                return Err(StateError::AlreadyFinished(id.clone()));
            }
            state.set_status(status, error);
            Ok(())
        })
    }

    async fn update_node_status(
        &self,
        id: &ExecutionId,
        node_id: &NodeId,
        status: NodeStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.modify(id, |state| {
            state.node_state_mut(node_id).transition(status, error);
            Ok(())
        })
    }

    async fn update_node_output(
        &self,
        id: &ExecutionId,
        node_id: &NodeId,
        envelope: &Envelope,
        usage: Option<&TokenUsage>,
    ) -> Result<()> {
        let stored = match &self.message_store {
            Some(store) => {
                spill_large_body(store.as_ref(), id, envelope, self.max_inline_bytes).await?
            }
            None => envelope.clone(),
        };
        self.modify(id, |state| {
            state.node_outputs.insert(node_id.clone(), stored);
            if let Some(usage) = usage {
                state.token_usage.add(usage);
            }
            Ok(())
        })
    }

    async fn update_variables(
        &self,
        id: &ExecutionId,
        variables: HashMap<String, Value>,
    ) -> Result<()> {
        self.modify(id, |state| {
            state.variables = variables;
            Ok(())
        })
    }

    async fn add_token_usage(&self, id: &ExecutionId, usage: &TokenUsage) -> Result<()> {
        self.modify(id, |state| {
            state.token_usage.add(usage);
            Ok(())
        })
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionState>> {
        let mut matching: Vec<ExecutionState> = self
            .states
            .read()
            .values()
            .filter(|state| {
                filter
                    .diagram_id
                    .as_ref()
                    .map_or(true, |d| state.diagram_id.as_ref() == Some(d))
                    && filter.status.map_or(true, |s| state.status == s)
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(matching
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect())
    }

    async fn cleanup_old(&self, retention_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(retention_days as i64);
        let mut states = self.states.write();
        let before = states.len();
        states.retain(|_, state| state.started_at >= cutoff);
        Ok((before - states.len()) as u64)
    }
}
