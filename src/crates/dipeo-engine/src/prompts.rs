//! Interactive prompt bus.
//!
//! Handlers that need user input register a one-shot future keyed by
//! `(execution, node)` and suspend. An external responder fulfils it via
//! [`PromptBus::resolve_input`]; on timeout the node resolves with an empty
//! string instead of failing. At most one prompt may be pending per
//! `(execution, node)`.

use crate::cancel::CancelToken;
use crate::events::ObserverBus;
use dashmap::DashMap;
use dipeo_core::error::ExecutionError;
use dipeo_core::ids::{ExecutionId, NodeId};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Default)]
pub struct PromptBus {
    pending: DashMap<(ExecutionId, NodeId), oneshot::Sender<String>>,
}

impl PromptBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `interactive_prompt`, then wait for a response, a timeout
    /// (resolving to `""` after `interactive_prompt_timeout`), or
    /// cancellation.
    pub async fn request_input(
        &self,
        observers: &ObserverBus,
        execution_id: &ExecutionId,
        node_id: &NodeId,
        prompt: &str,
        context: Value,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<String, ExecutionError> {
        let key = (execution_id.clone(), node_id.clone());
        let (tx, rx) = oneshot::channel();

        match self.pending.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ExecutionError::Validation(format!(
                    "node '{}' already has a pending prompt",
                    node_id
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(tx);
            }
        }

        observers
            .interactive_prompt(execution_id, node_id, prompt, &context)
            .await;
        debug!(execution = %execution_id, node = %node_id, "waiting for interactive input");

        tokio::select! {
            response = rx => match response {
                Ok(text) => Ok(text),
                // Responder vanished without answering; treat as cancelled.
                Err(_) => {
                    self.pending.remove(&key);
                    Err(ExecutionError::Cancelled("prompt abandoned".into()))
                }
            },
            _ = tokio::time::sleep(timeout) => {
                self.pending.remove(&key);
                observers.interactive_prompt_timeout(execution_id, node_id).await;
                Ok(String::new())
            }
            _ = cancel.cancelled() => {
                self.pending.remove(&key);
                Err(ExecutionError::Cancelled("execution aborted".into()))
            }
        }
    }

    /// Fulfil a pending prompt. Returns false when nothing was waiting.
    pub fn resolve_input(&self, execution_id: &ExecutionId, node_id: &NodeId, response: String) -> bool {
        match self.pending.remove(&(execution_id.clone(), node_id.clone())) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => false,
        }
    }

    pub fn has_pending(&self, execution_id: &ExecutionId, node_id: &NodeId) -> bool {
        self.pending.contains_key(&(execution_id.clone(), node_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn bus_and_ids() -> (Arc<PromptBus>, ObserverBus, ExecutionId, NodeId) {
        (
            Arc::new(PromptBus::new()),
            ObserverBus::default(),
            ExecutionId::new("e1"),
            NodeId::new("n1"),
        )
    }

    #[tokio::test]
    async fn test_resolve_fulfils_request() {
        let (bus, observers, execution, node) = bus_and_ids();

        let waiter = bus.clone();
        let (we, wn) = (execution.clone(), node.clone());
        let handle = tokio::spawn(async move {
            waiter
                .request_input(
                    &observers,
                    &we,
                    &wn,
                    "name?",
                    Value::Null,
                    Duration::from_secs(5),
                    &CancelToken::new(),
                )
                .await
        });

        // Wait for the pending entry to appear, then resolve it.
        for _ in 0..100 {
            if bus.has_pending(&execution, &node) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(bus.resolve_input(&execution, &node, "Ada".into()));

        let response = handle.await.unwrap().unwrap();
        assert_eq!(response, "Ada");
        assert!(!bus.has_pending(&execution, &node));
    }

    #[tokio::test]
    async fn test_timeout_resolves_empty() {
        let (bus, observers, execution, node) = bus_and_ids();
        let response = bus
            .request_input(
                &observers,
                &execution,
                &node,
                "anyone?",
                Value::Null,
                Duration::from_millis(20),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(response, "");
        assert!(!bus.has_pending(&execution, &node));
    }

    #[tokio::test]
    async fn test_late_resolve_returns_false() {
        let (bus, _, execution, node) = bus_and_ids();
        assert!(!bus.resolve_input(&execution, &node, "too late".into()));
    }

    #[tokio::test]
    async fn test_cancel_aborts_wait() {
        let (bus, observers, execution, node) = bus_and_ids();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = bus
            .request_input(
                &observers,
                &execution,
                &node,
                "q",
                Value::Null,
                Duration::from_secs(5),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled(_)));
    }
}
