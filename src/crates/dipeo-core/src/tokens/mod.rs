//! Token flow through the execution graph.
//!
//! The [`TokenManager`] owns all mutable scheduling state for one execution:
//!
//! - per-`(edge, epoch)` sequence counters (strictly monotonic from 1),
//! - the published envelopes, keyed `(edge, epoch, seq)`,
//! - per-`(consumer, edge, epoch)` consumption watermarks,
//! - branch decisions of condition nodes, keyed `(node, epoch)`,
//! - the current epoch.
//!
//! Epochs partition token sequences so cyclic regions can re-enter: the
//! engine calls [`TokenManager::begin_epoch`] when a loop wraps around, and
//! the new epoch starts with fresh sequences and no branch decisions.
//!
//! All operations are short critical sections behind a single mutex; there
//! is one manager per execution, and a single writer per consuming node, so
//! contention is negligible.

mod readiness;

use crate::diagram::{Diagram, EdgeRef, Node, NodeType};
use crate::envelope::{Envelope, EnvelopeBody, PortMap, PORT_CONDFALSE, PORT_CONDTRUE, PORT_DEFAULT};
use crate::ids::NodeId;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A sequence-numbered envelope on an edge, identified by
/// `(edge, epoch, seq)`.
#[derive(Clone, Debug)]
pub struct Token {
    pub epoch: u64,
    pub seq: u64,
    pub envelope: Envelope,
}

/// Which branch a condition node took.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchDecision {
    CondTrue,
    CondFalse,
}

impl BranchDecision {
    pub fn as_port(&self) -> &'static str {
        match self {
            BranchDecision::CondTrue => PORT_CONDTRUE,
            BranchDecision::CondFalse => PORT_CONDFALSE,
        }
    }

    pub fn from_port(port: &str) -> Option<Self> {
        match port {
            PORT_CONDTRUE => Some(BranchDecision::CondTrue),
            PORT_CONDFALSE => Some(BranchDecision::CondFalse),
            _ => None,
        }
    }

    /// Extract a decision from a condition output body: a bare boolean or
    /// an object with a boolean `result` field decides by truthiness.
    pub fn from_body(body: &EnvelopeBody) -> Option<Self> {
        let value = body.as_json()?;
        let flag = match value {
            Value::Bool(b) => *b,
            Value::Object(map) => match map.get("result") {
                Some(Value::Bool(b)) => *b,
                _ => return None,
            },
            _ => return None,
        };
        Some(if flag {
            BranchDecision::CondTrue
        } else {
            BranchDecision::CondFalse
        })
    }
}

/// Mutable token-flow state, always accessed under the manager's lock.
#[derive(Default)]
pub(crate) struct FlowState {
    pub(crate) epoch: u64,
    pub(crate) seq: HashMap<(EdgeRef, u64), u64>,
    pub(crate) tokens: HashMap<(EdgeRef, u64, u64), Envelope>,
    pub(crate) last_consumed: HashMap<(NodeId, EdgeRef, u64), u64>,
    pub(crate) branch_decisions: HashMap<(NodeId, u64), BranchDecision>,
}

impl FlowState {
    pub(crate) fn has_unconsumed(&self, node_id: &NodeId, edge: EdgeRef, epoch: u64) -> bool {
        let seq = self.seq.get(&(edge, epoch)).copied().unwrap_or(0);
        let consumed = self
            .last_consumed
            .get(&(node_id.clone(), edge, epoch))
            .copied()
            .unwrap_or(0);
        seq > consumed
    }
}

/// Manages token publication, consumption and epochs for one execution.
pub struct TokenManager {
    diagram: Arc<Diagram>,
    state: Mutex<FlowState>,
}

impl TokenManager {
    pub fn new(diagram: Arc<Diagram>) -> Self {
        Self {
            diagram,
            state: Mutex::new(FlowState::default()),
        }
    }

    pub fn diagram(&self) -> &Arc<Diagram> {
        &self.diagram
    }

    pub fn current_epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Start a new epoch (loop re-entry). Returns the new epoch number.
    pub fn begin_epoch(&self) -> u64 {
        let mut state = self.state.lock();
        state.epoch += 1;
        debug!(epoch = state.epoch, "began new epoch");
        state.epoch
    }

    /// Publish an envelope on an edge. Never blocks; each call mints the
    /// next sequence number for `(edge, epoch)`.
    pub fn publish(&self, edge: EdgeRef, envelope: Envelope, epoch: Option<u64>) -> Token {
        let mut state = self.state.lock();
        let epoch = epoch.unwrap_or(state.epoch);
        Self::publish_locked(&mut state, edge, envelope, epoch)
    }

    fn publish_locked(state: &mut FlowState, edge: EdgeRef, envelope: Envelope, epoch: u64) -> Token {
        let seq = state.seq.entry((edge, epoch)).or_insert(0);
        *seq += 1;
        let seq = *seq;
        state.tokens.insert((edge, epoch, seq), envelope.clone());
        Token {
            epoch,
            seq,
            envelope,
        }
    }

    /// Route a node's port-addressed outputs onto its outgoing edges.
    ///
    /// Each outgoing edge looks up its `source_output` port (empty port
    /// names read from `default`); edges whose port produced nothing get no
    /// token. Condition nodes additionally record their branch decision for
    /// the target epoch.
    pub fn emit_outputs(&self, node_id: &NodeId, outputs: &PortMap, epoch: Option<u64>) {
        let is_condition = self
            .diagram
            .node(node_id)
            .is_some_and(|n| n.node_type == NodeType::Condition);

        let mut state = self.state.lock();
        let epoch = epoch.unwrap_or(state.epoch);

        if is_condition {
            if let Some(decision) = Self::decide_branch(outputs) {
                debug!(node = %node_id, epoch, branch = decision.as_port(), "recorded branch decision");
                state.branch_decisions.insert((node_id.clone(), epoch), decision);
            }
        }

        for &edge_ref in self.diagram.outgoing_edges(node_id) {
            let edge = self.diagram.edge(edge_ref);
            let port = if edge.source_output.is_empty() {
                PORT_DEFAULT
            } else {
                edge.source_output.as_str()
            };
            if let Some(envelope) = outputs.get(port) {
                Self::publish_locked(&mut state, edge_ref, envelope.clone(), epoch);
            }
        }
    }

    fn decide_branch(outputs: &PortMap) -> Option<BranchDecision> {
        for port in [PORT_CONDTRUE, PORT_CONDFALSE, PORT_DEFAULT] {
            if let Some(envelope) = outputs.get(port) {
                if let Some(decision) = BranchDecision::from_body(&envelope.body) {
                    return Some(decision);
                }
                if let Some(decision) = BranchDecision::from_port(port) {
                    return Some(decision);
                }
            }
        }
        None
    }

    /// Atomically drain unconsumed inbound tokens for a node.
    ///
    /// For each incoming edge with a sequence past the node's watermark the
    /// watermark advances to the current sequence and the newest envelope is
    /// returned under the edge's `target_input` port (`default` when empty).
    /// A second call without new publications returns an empty map.
    pub fn consume_inbound(&self, node_id: &NodeId, epoch: Option<u64>) -> PortMap {
        let mut state = self.state.lock();
        let epoch = epoch.unwrap_or(state.epoch);
        let mut inputs = PortMap::new();

        for &edge_ref in self.diagram.incoming_edges(node_id) {
            let seq = state.seq.get(&(edge_ref, epoch)).copied().unwrap_or(0);
            let consumed_key = (node_id.clone(), edge_ref, epoch);
            let consumed = state.last_consumed.get(&consumed_key).copied().unwrap_or(0);
            if seq <= consumed {
                continue;
            }

            state.last_consumed.insert(consumed_key, seq);

            if let Some(envelope) = state.tokens.get(&(edge_ref, epoch, seq)) {
                let edge = self.diagram.edge(edge_ref);
                let port = if edge.target_input.is_empty() {
                    PORT_DEFAULT.to_string()
                } else {
                    edge.target_input.clone()
                };
                inputs.insert(port, envelope.clone());
            }
        }

        inputs
    }

    /// Branch decision recorded for a condition node in the current epoch.
    pub fn branch_decision(&self, node_id: &NodeId) -> Option<BranchDecision> {
        let state = self.state.lock();
        state.branch_decisions.get(&(node_id.clone(), state.epoch)).copied()
    }

    pub fn branch_decision_at(&self, node_id: &NodeId, epoch: u64) -> Option<BranchDecision> {
        self.state
            .lock()
            .branch_decisions
            .get(&(node_id.clone(), epoch))
            .copied()
    }

    /// Whether `node` is ready to run in the current epoch, given how many
    /// times it has already executed. Applies start-edge filtering,
    /// skippable-condition handling, branch filtering and the node's join
    /// policy (see the readiness module).
    pub fn is_ready(&self, node: &Node, exec_count: u32) -> bool {
        let state = self.state.lock();
        let epoch = state.epoch;
        readiness::evaluate(&self.diagram, &state, node, epoch, exec_count)
    }

    /// Current sequence number for `(edge, epoch)`; 0 if never published.
    pub fn current_seq(&self, edge: EdgeRef, epoch: u64) -> u64 {
        self.state.lock().seq.get(&(edge, epoch)).copied().unwrap_or(0)
    }

    /// Last consumed sequence number for `(node, edge, epoch)`.
    pub fn last_consumed_seq(&self, node_id: &NodeId, edge: EdgeRef, epoch: u64) -> u64 {
        self.state
            .lock()
            .last_consumed
            .get(&(node_id.clone(), edge, epoch))
            .copied()
            .unwrap_or(0)
    }

    /// Whether an edge holds a token the node has not consumed yet.
    pub fn has_unconsumed(&self, node_id: &NodeId, edge: EdgeRef, epoch: u64) -> bool {
        self.state.lock().has_unconsumed(node_id, edge, epoch)
    }
}
