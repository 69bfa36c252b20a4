//! Lifecycle events and the observer contract.
//!
//! The engine publishes every lifecycle transition through an
//! [`ObserverBus`]. Observers are notified sequentially in registration
//! order, which is what guarantees the per-node event ordering
//! (`node_start` before `node_progress*` before one of
//! `node_complete`/`node_error`/`node_skipped`); across nodes only
//! per-subscriber FIFO holds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dipeo_core::envelope::Envelope;
use dipeo_core::error::FailureDetail;
use dipeo_core::ids::{DiagramId, ExecutionId, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Wire-level event type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ExecutionStart,
    ExecutionComplete,
    ExecutionError,
    NodeStart,
    NodeProgress,
    NodeComplete,
    NodeError,
    NodeSkipped,
    InteractivePrompt,
    InteractivePromptTimeout,
}

impl EventType {
    /// High-rate events that streaming queues may drop under pressure.
    pub fn is_progress(&self) -> bool {
        matches!(self, EventType::NodeProgress)
    }

    /// Terminal events end a subscription.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventType::ExecutionComplete | EventType::ExecutionError)
    }
}

/// One message on the event stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub execution_id: ExecutionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl ExecutionEvent {
    pub fn new(
        event_type: EventType,
        execution_id: ExecutionId,
        node_id: Option<NodeId>,
        data: Value,
    ) -> Self {
        Self {
            event_type,
            execution_id,
            node_id,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Subscriber to engine lifecycle events. Every callback has a default
/// no-op body so observers implement only what they care about.
#[async_trait]
pub trait ExecutionObserver: Send + Sync {
    async fn on_execution_start(&self, _execution_id: &ExecutionId, _diagram_id: Option<&DiagramId>) {}

    async fn on_execution_complete(&self, _execution_id: &ExecutionId) {}

    async fn on_execution_error(&self, _execution_id: &ExecutionId, _error: &FailureDetail) {}

    async fn on_node_start(&self, _execution_id: &ExecutionId, _node_id: &NodeId) {}

    async fn on_node_progress(&self, _execution_id: &ExecutionId, _node_id: &NodeId, _message: &str) {}

    async fn on_node_complete(&self, _execution_id: &ExecutionId, _node_id: &NodeId, _output: &Envelope) {}

    async fn on_node_error(&self, _execution_id: &ExecutionId, _node_id: &NodeId, _error: &FailureDetail) {}

    async fn on_node_skipped(&self, _execution_id: &ExecutionId, _node_id: &NodeId, _reason: Option<&str>) {}

    async fn on_interactive_prompt(
        &self,
        _execution_id: &ExecutionId,
        _node_id: &NodeId,
        _prompt: &str,
        _context: &Value,
    ) {
    }

    async fn on_interactive_prompt_timeout(&self, _execution_id: &ExecutionId, _node_id: &NodeId) {}
}

/// Fans one lifecycle transition out to every registered observer, in
/// order, awaiting each.
#[derive(Clone, Default)]
pub struct ObserverBus {
    observers: Vec<Arc<dyn ExecutionObserver>>,
}

impl ObserverBus {
    pub fn new(observers: Vec<Arc<dyn ExecutionObserver>>) -> Self {
        Self { observers }
    }

    pub fn push(&mut self, observer: Arc<dyn ExecutionObserver>) {
        self.observers.push(observer);
    }

    pub async fn execution_start(&self, execution_id: &ExecutionId, diagram_id: Option<&DiagramId>) {
        for observer in &self.observers {
            observer.on_execution_start(execution_id, diagram_id).await;
        }
    }

    pub async fn execution_complete(&self, execution_id: &ExecutionId) {
        for observer in &self.observers {
            observer.on_execution_complete(execution_id).await;
        }
    }

    pub async fn execution_error(&self, execution_id: &ExecutionId, error: &FailureDetail) {
        for observer in &self.observers {
            observer.on_execution_error(execution_id, error).await;
        }
    }

    pub async fn node_start(&self, execution_id: &ExecutionId, node_id: &NodeId) {
        for observer in &self.observers {
            observer.on_node_start(execution_id, node_id).await;
        }
    }

    pub async fn node_progress(&self, execution_id: &ExecutionId, node_id: &NodeId, message: &str) {
        for observer in &self.observers {
            observer.on_node_progress(execution_id, node_id, message).await;
        }
    }

    pub async fn node_complete(&self, execution_id: &ExecutionId, node_id: &NodeId, output: &Envelope) {
        for observer in &self.observers {
            observer.on_node_complete(execution_id, node_id, output).await;
        }
    }

    pub async fn node_error(&self, execution_id: &ExecutionId, node_id: &NodeId, error: &FailureDetail) {
        for observer in &self.observers {
            observer.on_node_error(execution_id, node_id, error).await;
        }
    }

    pub async fn node_skipped(&self, execution_id: &ExecutionId, node_id: &NodeId, reason: Option<&str>) {
        for observer in &self.observers {
            observer.on_node_skipped(execution_id, node_id, reason).await;
        }
    }

    pub async fn interactive_prompt(
        &self,
        execution_id: &ExecutionId,
        node_id: &NodeId,
        prompt: &str,
        context: &Value,
    ) {
        for observer in &self.observers {
            observer
                .on_interactive_prompt(execution_id, node_id, prompt, context)
                .await;
        }
    }

    pub async fn interactive_prompt_timeout(&self, execution_id: &ExecutionId, node_id: &NodeId) {
        for observer in &self.observers {
            observer.on_interactive_prompt_timeout(execution_id, node_id).await;
        }
    }
}
