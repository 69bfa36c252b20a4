//! Compiled diagram model.
//!
//! A [`Diagram`] is the read-only structure the engine executes: typed nodes,
//! typed edges between output and input ports, and person (LLM agent)
//! definitions. Diagrams are assembled through [`DiagramBuilder`], which
//! validates the structural invariants on `build()`:
//!
//! - every edge endpoint refers to an existing node,
//! - `start` nodes have no incoming edges,
//! - `endpoint` nodes have no outgoing edges.
//!
//! Cross-references are IDs or edge indices ([`EdgeRef`]), never owning
//! pointers, so cyclic diagrams are represented without any reference
//! cycles in memory.

use crate::envelope::ContentType;
use crate::error::{ExecutionError, Result};
use crate::ids::{ApiKeyId, ArrowId, DiagramId, NodeId, PersonId};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Closed set of node types the engine knows how to dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    Endpoint,
    Condition,
    PersonJob,
    CodeJob,
    ApiJob,
    Db,
    UserResponse,
    SubDiagram,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Start => "start",
            NodeType::Endpoint => "endpoint",
            NodeType::Condition => "condition",
            NodeType::PersonJob => "person_job",
            NodeType::CodeJob => "code_job",
            NodeType::ApiJob => "api_job",
            NodeType::Db => "db",
            NodeType::UserResponse => "user_response",
            NodeType::SubDiagram => "sub_diagram",
        }
    }

    /// Whether nodes of this type normally publish an output envelope.
    /// Used when a skipped node must still unblock downstream joins.
    pub fn produces_output(&self) -> bool {
        !matches!(self, NodeType::Endpoint)
    }
}

/// What the engine does when a node fails after exhausting retries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    /// Fail the whole execution (default).
    #[default]
    Abort,
    /// Drop the node's outputs and keep going; downstream edges are
    /// treated as absent.
    Continue,
}

/// Readiness predicate over a node's incoming edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    All,
    Any,
    First,
    KOfN { k: usize },
}

impl JoinPolicy {
    /// Evaluate the policy given how many of the filtered edges carry an
    /// unconsumed token.
    pub fn satisfied(&self, available: usize, total: usize) -> bool {
        match self {
            JoinPolicy::All => available == total,
            JoinPolicy::Any | JoinPolicy::First => available > 0,
            JoinPolicy::KOfN { k } => available >= *k,
        }
    }
}

/// Per-node configuration shared by all node types; handler-specific
/// settings live in `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub label: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_iterations: Option<u32>,
    pub on_error: ErrorAction,
    pub skippable: bool,
    pub join: Option<JoinPolicy>,
    pub retry: Option<RetryPolicy>,
    pub extra: Value,
}

/// A typed node in a compiled diagram.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub config: NodeConfig,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            config: NodeConfig::default(),
        }
    }

    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.config.label = Some(label.into());
        self
    }

    pub fn with_timeout_ms(mut self, millis: u64) -> Self {
        self.config.timeout_ms = Some(millis);
        self
    }

    pub fn with_max_iterations(mut self, count: u32) -> Self {
        self.config.max_iterations = Some(count);
        self
    }

    pub fn with_on_error(mut self, action: ErrorAction) -> Self {
        self.config.on_error = action;
        self
    }

    pub fn skippable(mut self) -> Self {
        self.config.skippable = true;
        self
    }

    pub fn with_join(mut self, policy: JoinPolicy) -> Self {
        self.config.join = Some(policy);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = Some(policy);
        self
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.config.extra = extra;
        self
    }

    pub fn label(&self) -> &str {
        self.config.label.as_deref().unwrap_or_else(|| self.id.as_str())
    }
}

/// A directed, port-addressed connection between two nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: ArrowId,
    pub source_node_id: NodeId,
    pub source_output: String,
    pub target_node_id: NodeId,
    pub target_input: String,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
}

/// Cheap copyable handle to an edge within its diagram.
///
/// Token-manager state is keyed by `(EdgeRef, epoch)`; resolving the handle
/// back to the [`Edge`] goes through [`Diagram::edge`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeRef(usize);

impl EdgeRef {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A configured LLM agent referenced by `person_job` nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersonSpec {
    pub service: String,
    pub model: String,
    pub api_key_id: ApiKeyId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// A compiled, validated diagram. Read-only during execution.
#[derive(Clone, Debug)]
pub struct Diagram {
    id: Option<DiagramId>,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    persons: HashMap<PersonId, PersonSpec>,
    node_lookup: HashMap<NodeId, usize>,
    incoming: HashMap<NodeId, Vec<EdgeRef>>,
    outgoing: HashMap<NodeId, Vec<EdgeRef>>,
    topo_index: HashMap<NodeId, usize>,
}

impl Diagram {
    pub fn id(&self) -> Option<&DiagramId> {
        self.id.as_ref()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.node_lookup.get(id).map(|&i| &self.nodes[i])
    }

    /// Resolve a raw string to the id of an existing node.
    pub fn node_id(&self, id: &str) -> Option<NodeId> {
        let candidate = NodeId::new(id);
        self.node_lookup.contains_key(&candidate).then_some(candidate)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge(&self, edge: EdgeRef) -> &Edge {
        &self.edges[edge.0]
    }

    pub fn incoming_edges(&self, id: &NodeId) -> &[EdgeRef] {
        self.incoming.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn outgoing_edges(&self, id: &NodeId) -> &[EdgeRef] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn persons(&self) -> &HashMap<PersonId, PersonSpec> {
        &self.persons
    }

    pub fn person(&self, id: &PersonId) -> Option<&PersonSpec> {
        self.persons.get(id)
    }

    /// Display label for a person: configured label, else the raw id.
    pub fn person_label(&self, id: &PersonId) -> String {
        self.persons
            .get(id)
            .and_then(|p| p.label.clone())
            .unwrap_or_else(|| id.as_str().to_string())
    }

    pub fn start_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.node_type == NodeType::Start)
    }

    pub fn endpoint_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.node_type == NodeType::Endpoint)
    }

    /// Effective join policy for a node: explicit config wins, otherwise
    /// derived from the node type. Nodes that sit downstream of condition
    /// fans or loop re-entries (`person_job`, `user_response`, `endpoint`)
    /// default to `any`; everything else waits for all inputs.
    pub fn join_policy(&self, node: &Node) -> JoinPolicy {
        if let Some(policy) = node.config.join {
            return policy;
        }
        match node.node_type {
            NodeType::PersonJob | NodeType::UserResponse | NodeType::Endpoint => JoinPolicy::Any,
            _ => JoinPolicy::All,
        }
    }

    /// Stable scheduling index: topological position where the graph is
    /// acyclic, insertion order inside cyclic regions.
    pub fn topo_index(&self, id: &NodeId) -> usize {
        self.topo_index.get(id).copied().unwrap_or(usize::MAX)
    }
}

/// Builder and validator for [`Diagram`].
#[derive(Default)]
pub struct DiagramBuilder {
    id: Option<DiagramId>,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    persons: HashMap<PersonId, PersonSpec>,
}

impl DiagramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagram_id(mut self, id: impl Into<DiagramId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add an edge with default content type and an auto-generated arrow id.
    pub fn edge(
        self,
        source: impl Into<NodeId>,
        source_output: impl Into<String>,
        target: impl Into<NodeId>,
        target_input: impl Into<String>,
    ) -> Self {
        self.typed_edge(source, source_output, target, target_input, ContentType::RawText)
    }

    pub fn typed_edge(
        mut self,
        source: impl Into<NodeId>,
        source_output: impl Into<String>,
        target: impl Into<NodeId>,
        target_input: impl Into<String>,
        content_type: ContentType,
    ) -> Self {
        let id = ArrowId::new(format!("arrow_{}", self.edges.len()));
        self.edges.push(Edge {
            id,
            source_node_id: source.into(),
            source_output: source_output.into(),
            target_node_id: target.into(),
            target_input: target_input.into(),
            content_type,
            label: None,
            transform: None,
        });
        self
    }

    pub fn person(mut self, id: impl Into<PersonId>, spec: PersonSpec) -> Self {
        self.persons.insert(id.into(), spec);
        self
    }

    /// Validate the structure and compile adjacency and scheduling indexes.
    pub fn build(self) -> Result<Diagram> {
        let mut node_lookup = HashMap::with_capacity(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            if node_lookup.insert(node.id.clone(), i).is_some() {
                return Err(ExecutionError::Validation(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        let mut incoming: HashMap<NodeId, Vec<EdgeRef>> = HashMap::new();
        let mut outgoing: HashMap<NodeId, Vec<EdgeRef>> = HashMap::new();

        for (i, edge) in self.edges.iter().enumerate() {
            for endpoint in [&edge.source_node_id, &edge.target_node_id] {
                if !node_lookup.contains_key(endpoint) {
                    return Err(ExecutionError::Validation(format!(
                        "edge '{}' references unknown node '{}'",
                        edge.id, endpoint
                    )));
                }
            }
            outgoing.entry(edge.source_node_id.clone()).or_default().push(EdgeRef(i));
            incoming.entry(edge.target_node_id.clone()).or_default().push(EdgeRef(i));
        }

        for node in &self.nodes {
            match node.node_type {
                NodeType::Start => {
                    if incoming.get(&node.id).is_some_and(|e| !e.is_empty()) {
                        return Err(ExecutionError::Validation(format!(
                            "start node '{}' must not have incoming edges",
                            node.id
                        )));
                    }
                }
                NodeType::Endpoint => {
                    if outgoing.get(&node.id).is_some_and(|e| !e.is_empty()) {
                        return Err(ExecutionError::Validation(format!(
                            "endpoint node '{}' must not have outgoing edges",
                            node.id
                        )));
                    }
                }
                _ => {}
            }
        }

        let topo_index = compute_topo_index(&self.nodes, &self.edges, &node_lookup);

        Ok(Diagram {
            id: self.id,
            nodes: self.nodes,
            edges: self.edges,
            persons: self.persons,
            node_lookup,
            incoming,
            outgoing,
            topo_index,
        })
    }
}

/// Kahn's algorithm with insertion-order tie-breaking; cycles are broken by
/// placing the earliest-inserted remaining node, so the result is total and
/// deterministic even for cyclic diagrams.
fn compute_topo_index(
    nodes: &[Node],
    edges: &[Edge],
    node_lookup: &HashMap<NodeId, usize>,
) -> HashMap<NodeId, usize> {
    let mut indegree = vec![0usize; nodes.len()];
    for edge in edges {
        if let Some(&target) = node_lookup.get(&edge.target_node_id) {
            indegree[target] += 1;
        }
    }

    let mut order = HashMap::with_capacity(nodes.len());
    let mut placed = vec![false; nodes.len()];

    for position in 0..nodes.len() {
        let next = (0..nodes.len())
            .find(|&i| !placed[i] && indegree[i] == 0)
            .or_else(|| (0..nodes.len()).find(|&i| !placed[i]));
        let Some(i) = next else { break };

        placed[i] = true;
        order.insert(nodes[i].id.clone(), position);

        for edge in edges {
            if edge.source_node_id == nodes[i].id {
                if let Some(&target) = node_lookup.get(&edge.target_node_id) {
                    indegree[target] = indegree[target].saturating_sub(1);
                }
            }
        }
    }

    order
}
