//! Observer that mirrors lifecycle events into the state registry.
//!
//! A failed write is retried once; if it fails again the observer marks
//! itself unhealthy and the engine escalates the execution to `failed` at
//! its next scheduling point.

use crate::events::ExecutionObserver;
use async_trait::async_trait;
use dipeo_core::envelope::Envelope;
use dipeo_core::error::FailureDetail;
use dipeo_core::ids::{DiagramId, ExecutionId, NodeId};
use dipeo_state::{ExecutionStatus, NodeStatus, StateError, StateStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

pub struct StateStoreObserver {
    store: Arc<dyn StateStore>,
    unhealthy: AtomicBool,
}

impl StateStoreObserver {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            unhealthy: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// True once a state write has failed twice in a row.
    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy.load(Ordering::Relaxed)
    }

    async fn with_retry<F, Fut>(&self, what: &str, op: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<(), StateError>>,
    {
        match op().await {
            Ok(()) => return,
            Err(StateError::AlreadyFinished(id)) => {
                warn!(execution = %id, op = what, "state write after terminal status ignored");
                return;
            }
            Err(first) => {
                warn!(op = what, error = %first, "state write failed, retrying once");
            }
        }
        match op().await {
            Ok(()) => {}
            Err(StateError::AlreadyFinished(_)) => {}
            Err(second) => {
                error!(op = what, error = %second, "state write failed twice, marking registry unhealthy");
                self.unhealthy.store(true, Ordering::Relaxed);
            }
        }
    }
}

#[async_trait]
impl ExecutionObserver for StateStoreObserver {
    async fn on_execution_start(&self, execution_id: &ExecutionId, diagram_id: Option<&DiagramId>) {
        self.with_retry("create_execution", || async {
            self.store
                .create_execution(execution_id, diagram_id, HashMap::new())
                .await
                .map(|_| ())
        })
        .await;
    }

    async fn on_execution_complete(&self, execution_id: &ExecutionId) {
        self.with_retry("update_status", || async {
            self.store
                .update_status(execution_id, ExecutionStatus::Completed, None)
                .await
        })
        .await;
    }

    async fn on_execution_error(&self, execution_id: &ExecutionId, error: &FailureDetail) {
        let message = error.message.clone();
        self.with_retry("update_status", || {
            let message = message.clone();
            async move {
                self.store
                    .update_status(execution_id, failure_status(error), Some(message))
                    .await
            }
        })
        .await;
    }

    async fn on_node_start(&self, execution_id: &ExecutionId, node_id: &NodeId) {
        self.with_retry("update_node_status", || async {
            self.store
                .update_node_status(execution_id, node_id, NodeStatus::Running, None)
                .await
        })
        .await;
    }

    async fn on_node_complete(&self, execution_id: &ExecutionId, node_id: &NodeId, output: &Envelope) {
        self.with_retry("update_node_status", || async {
            self.store
                .update_node_status(execution_id, node_id, NodeStatus::Completed, None)
                .await
        })
        .await;
        self.with_retry("update_node_output", || async {
            self.store
                .update_node_output(execution_id, node_id, output, output.meta.llm_usage.as_ref())
                .await
        })
        .await;
    }

    async fn on_node_error(&self, execution_id: &ExecutionId, node_id: &NodeId, error: &FailureDetail) {
        let message = error.message.clone();
        self.with_retry("update_node_status", || {
            let message = message.clone();
            async move {
                self.store
                    .update_node_status(execution_id, node_id, NodeStatus::Failed, Some(message))
                    .await
            }
        })
        .await;
    }

    async fn on_node_skipped(&self, execution_id: &ExecutionId, node_id: &NodeId, reason: Option<&str>) {
        let reason = reason.map(|r| r.to_string());
        self.with_retry("update_node_status", || {
            let reason = reason.clone();
            async move {
                self.store
                    .update_node_status(execution_id, node_id, NodeStatus::Skipped, reason)
                    .await
            }
        })
        .await;
    }
}

/// Cancelled executions end `aborted`; everything else ends `failed`.
fn failure_status(error: &FailureDetail) -> ExecutionStatus {
    if error.kind == dipeo_core::error::ErrorKind::Cancelled {
        ExecutionStatus::Aborted
    } else {
        ExecutionStatus::Failed
    }
}
