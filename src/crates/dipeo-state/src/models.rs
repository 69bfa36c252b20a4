//! Execution-state models persisted by the registry.

use chrono::{DateTime, Utc};
use dipeo_core::envelope::Envelope;
use dipeo_core::ids::{DiagramId, ExecutionId, NodeId};
use dipeo_core::usage::TokenUsage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// Lifecycle status of an execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Aborted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Aborted => "aborted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "aborted" => Some(ExecutionStatus::Aborted),
            _ => None,
        }
    }
}

/// Lifecycle status of a node within an execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Paused,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped
        )
    }

    /// Legal transitions: `pending -> running`, `running -> terminal`,
    /// `pending -> skipped`, `running <-> paused`. Terminal states are
    /// absorbing.
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        match (self, next) {
            (NodeStatus::Pending, NodeStatus::Running) => true,
            (NodeStatus::Pending, NodeStatus::Skipped) => true,
            (NodeStatus::Running, NodeStatus::Completed) => true,
            (NodeStatus::Running, NodeStatus::Failed) => true,
            (NodeStatus::Running, NodeStatus::Skipped) => true,
            (NodeStatus::Running, NodeStatus::Paused) => true,
            (NodeStatus::Paused, NodeStatus::Running) => true,
            // Re-execution in a later loop iteration.
            (NodeStatus::Completed, NodeStatus::Running) => true,
            _ => false,
        }
    }
}

/// Per-node state within one execution. Created lazily on first start.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_usage: Option<TokenUsage>,
    /// Incremented every time the node starts.
    #[serde(default)]
    pub exec_count: u32,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            status: NodeStatus::Pending,
            started_at: None,
            ended_at: None,
            error: None,
            llm_usage: None,
            exec_count: 0,
        }
    }
}

impl NodeState {
    /// Apply a status transition, enforcing the lifecycle. Illegal
    /// transitions are ignored with a warning (terminal states absorb).
    /// Returns whether the transition was applied.
    pub fn transition(&mut self, status: NodeStatus, error: Option<String>) -> bool {
        if self.status == status {
            // Repeated running (loop iteration) still counts an execution.
            if status == NodeStatus::Running {
                self.exec_count += 1;
                self.started_at = Some(Utc::now());
            }
            return true;
        }
        if !self.status.can_transition_to(status) {
            warn!(from = ?self.status, to = ?status, "ignoring illegal node status transition");
            return false;
        }
        self.status = status;
        match status {
            NodeStatus::Running => {
                self.exec_count += 1;
                self.started_at = Some(Utc::now());
                self.ended_at = None;
                self.error = None;
            }
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped => {
                self.ended_at = Some(Utc::now());
                self.error = error;
            }
            _ => {}
        }
        true
    }
}

/// The complete persisted state of one execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub id: ExecutionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagram_id: Option<DiagramId>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub node_states: HashMap<NodeId, NodeState>,
    #[serde(default)]
    pub node_outputs: HashMap<NodeId, Envelope>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub is_active: bool,
}

impl ExecutionState {
    pub fn new(
        id: ExecutionId,
        diagram_id: Option<DiagramId>,
        variables: HashMap<String, Value>,
    ) -> Self {
        Self {
            id,
            diagram_id,
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            node_states: HashMap::new(),
            node_outputs: HashMap::new(),
            variables,
            token_usage: TokenUsage::default(),
            error: None,
            is_active: true,
        }
    }

    /// Transition the execution status; terminal statuses stamp `ended_at`
    /// and deactivate the execution.
    pub fn set_status(&mut self, status: ExecutionStatus, error: Option<String>) {
        self.status = status;
        if let Some(error) = error {
            self.error = Some(error);
        }
        if status.is_terminal() {
            self.ended_at = Some(Utc::now());
            self.is_active = false;
        }
    }

    pub fn node_state_mut(&mut self, node_id: &NodeId) -> &mut NodeState {
        self.node_states.entry(node_id.clone()).or_default()
    }

    pub fn exec_count(&self, node_id: &NodeId) -> u32 {
        self.node_states.get(node_id).map_or(0, |s| s.exec_count)
    }
}

/// Query filter for [`StateStore::list_executions`](crate::StateStore).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagram_id: Option<DiagramId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for ExecutionFilter {
    fn default() -> Self {
        Self {
            diagram_id: None,
            status: None,
            limit: 100,
            offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Aborted.is_terminal());
        assert!(NodeStatus::Skipped.is_terminal());
        assert!(!NodeStatus::Paused.is_terminal());
    }

    #[test]
    fn test_node_lifecycle_transitions() {
        let mut state = NodeState::default();
        assert!(state.transition(NodeStatus::Running, None));
        assert_eq!(state.exec_count, 1);
        assert!(state.started_at.is_some());

        assert!(state.transition(NodeStatus::Paused, None));
        assert!(state.transition(NodeStatus::Running, None));
        assert!(state.transition(NodeStatus::Completed, None));
        assert!(state.ended_at.is_some());
    }

    #[test]
    fn test_terminal_node_states_absorbing() {
        let mut state = NodeState::default();
        state.transition(NodeStatus::Running, None);
        state.transition(NodeStatus::Failed, Some("boom".into()));

        assert!(!state.transition(NodeStatus::Running, None));
        assert!(!state.transition(NodeStatus::Paused, None));
        assert_eq!(state.status, NodeStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_completed_node_can_rerun_in_loop() {
        let mut state = NodeState::default();
        state.transition(NodeStatus::Running, None);
        state.transition(NodeStatus::Completed, None);
        assert!(state.transition(NodeStatus::Running, None));
        assert_eq!(state.exec_count, 2);
        assert!(state.ended_at.is_none());
    }

    #[test]
    fn test_pending_to_skipped() {
        let mut state = NodeState::default();
        assert!(state.transition(NodeStatus::Skipped, Some("requested".into())));
        assert_eq!(state.exec_count, 0);
        assert!(state.ended_at.is_some());
    }

    #[test]
    fn test_execution_terminal_deactivates() {
        let mut state = ExecutionState::new(ExecutionId::new("e1"), None, HashMap::new());
        assert!(state.is_active);
        state.set_status(ExecutionStatus::Running, None);
        assert!(state.is_active);
        state.set_status(ExecutionStatus::Completed, None);
        assert!(!state.is_active);
        assert!(state.ended_at.is_some());
    }

    #[test]
    fn test_state_json_round_trip() {
        let mut state = ExecutionState::new(
            ExecutionId::new("e1"),
            Some(DiagramId::new("d1")),
            [("x".to_string(), serde_json::json!("hello"))].into_iter().collect(),
        );
        state.node_state_mut(&NodeId::new("n1")).transition(NodeStatus::Running, None);
        state.token_usage.add(&TokenUsage::new(3, 2));
        state.node_outputs.insert(
            NodeId::new("n1"),
            Envelope::text(NodeId::new("n1"), "out"),
        );

        let json = serde_json::to_string(&state).unwrap();
        let back: ExecutionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Aborted,
        ] {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ExecutionStatus::parse("bogus"), None);
    }
}
