//! `user_response` nodes wait for interactive input.
//!
//! The prompt timeout is the node's configured timeout; expiry resolves
//! the node with an empty string rather than failing it.

use super::extra_str;
use crate::handler::{HandlerContext, NodeHandler};
use async_trait::async_trait;
use dipeo_core::diagram::{Node, NodeType};
use dipeo_core::envelope::{Envelope, PortMap, PORT_DEFAULT};
use dipeo_core::error::ExecutionError;
use serde_json::json;
use std::time::Duration;

pub struct UserResponseHandler;

#[async_trait]
impl NodeHandler for UserResponseHandler {
    fn node_type(&self) -> NodeType {
        NodeType::UserResponse
    }

    async fn execute(
        &self,
        node: &Node,
        inputs: PortMap,
        ctx: &HandlerContext,
    ) -> Result<PortMap, ExecutionError> {
        let prompt = extra_str(&node.config.extra, "prompt").unwrap_or("Input required");
        let timeout = node
            .config
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(ctx.node_timeout);

        let context = json!({
            "inputs": inputs
                .iter()
                .map(|(port, envelope)| (port.clone(), envelope.body.to_value()))
                .collect::<serde_json::Map<_, _>>(),
        });

        let response = ctx.request_input(prompt, context, timeout).await?;

        let envelope =
            Envelope::text(node.id.clone(), response).with_trace_id(ctx.execution_id.as_str());
        Ok([(PORT_DEFAULT.to_string(), envelope)].into_iter().collect())
    }
}
