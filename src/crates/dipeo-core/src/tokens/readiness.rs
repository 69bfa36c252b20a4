//! Node readiness evaluation.
//!
//! Decides whether a node may run in a given epoch by filtering its incoming
//! edges and evaluating the node's join policy over what remains:
//!
//! 1. drop edges from `start` nodes once the node has executed (start nodes
//!    emit exactly once per execution),
//! 2. treat edges from skippable condition nodes as optional when the node
//!    has at least one other distinct source (if everything is skippable,
//!    nothing is),
//! 3. drop `condtrue`/`condfalse` edges whose source decided the other way
//!    in this epoch,
//! 4. evaluate the join policy over the remaining edges; an empty remainder
//!    is never ready (start nodes are seeded directly by the engine).

use super::FlowState;
use crate::diagram::{Diagram, EdgeRef, Node, NodeType};
use crate::envelope::{PORT_CONDFALSE, PORT_CONDTRUE};
use std::collections::HashSet;

pub(crate) fn evaluate(
    diagram: &Diagram,
    state: &FlowState,
    node: &Node,
    epoch: u64,
    exec_count: u32,
) -> bool {
    let edges = diagram.incoming_edges(&node.id);
    if edges.is_empty() {
        return false;
    }

    let relevant = relevant_edges(diagram, edges, exec_count);
    let active = drop_skippable(diagram, &relevant);
    let required = filter_by_branch(diagram, state, &active, epoch);

    if required.is_empty() {
        return false;
    }

    let available = required
        .iter()
        .filter(|&&edge| state.has_unconsumed(&node.id, edge, epoch))
        .count();

    diagram.join_policy(node).satisfied(available, required.len())
}

/// Start nodes provide tokens exactly once; after the node's first run
/// their edges no longer count.
fn relevant_edges(diagram: &Diagram, edges: &[EdgeRef], exec_count: u32) -> Vec<EdgeRef> {
    edges
        .iter()
        .copied()
        .filter(|&edge| {
            let source = diagram.node(&diagram.edge(edge).source_node_id);
            let from_start = source.is_some_and(|n| n.node_type == NodeType::Start);
            !(from_start && exec_count > 0)
        })
        .collect()
}

/// Edges from skippable conditions are optional only when other distinct
/// sources exist; if every edge is skippable they are all kept.
fn drop_skippable(diagram: &Diagram, edges: &[EdgeRef]) -> Vec<EdgeRef> {
    let unique_sources: HashSet<_> = edges
        .iter()
        .map(|&e| diagram.edge(e).source_node_id.clone())
        .collect();

    let mut active = Vec::new();
    let mut skippable = Vec::new();

    for &edge in edges {
        let source = diagram.node(&diagram.edge(edge).source_node_id);
        let is_skippable_condition = source
            .is_some_and(|n| n.node_type == NodeType::Condition && n.config.skippable);

        if is_skippable_condition && unique_sources.len() > 1 {
            skippable.push(edge);
        } else {
            active.push(edge);
        }
    }

    if active.is_empty() {
        skippable
    } else {
        active
    }
}

/// Keep branch edges only when the condition decided for them (or has not
/// decided yet in this epoch).
fn filter_by_branch(
    diagram: &Diagram,
    state: &FlowState,
    edges: &[EdgeRef],
    epoch: u64,
) -> Vec<EdgeRef> {
    edges
        .iter()
        .copied()
        .filter(|&edge_ref| {
            let edge = diagram.edge(edge_ref);
            if edge.source_output != PORT_CONDTRUE && edge.source_output != PORT_CONDFALSE {
                return true;
            }
            match state
                .branch_decisions
                .get(&(edge.source_node_id.clone(), epoch))
            {
                Some(decision) => decision.as_port() == edge.source_output,
                None => true,
            }
        })
        .collect()
}
