//! `endpoint` nodes terminate a branch and keep a representative result.

use super::{body_to_string, extra_str};
use crate::handler::{HandlerContext, NodeHandler};
use async_trait::async_trait;
use dipeo_core::diagram::{Node, NodeType};
use dipeo_core::envelope::{Envelope, PortMap, PORT_DEFAULT};
use dipeo_core::error::ExecutionError;

pub struct EndpointHandler;

#[async_trait]
impl NodeHandler for EndpointHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Endpoint
    }

    async fn execute(
        &self,
        node: &Node,
        inputs: PortMap,
        ctx: &HandlerContext,
    ) -> Result<PortMap, ExecutionError> {
        let mut representative = inputs
            .get(PORT_DEFAULT)
            .cloned()
            .or_else(|| {
                let mut ports: Vec<&String> = inputs.keys().collect();
                ports.sort();
                ports.first().and_then(|p| inputs.get(*p)).cloned()
            })
            .unwrap_or_else(|| Envelope::empty(node.id.clone()));
        // The upstream producer already accounted for its own usage; a
        // passed-through envelope must not be counted twice.
        representative.meta.llm_usage = None;

        if let Some(path) = extra_str(&node.config.extra, "save_to_file") {
            ctx.files()?
                .write(path, &body_to_string(&representative))
                .await?;
        }

        // Endpoints have no outgoing edges; the returned envelope is only
        // persisted as the node's output.
        Ok([(PORT_DEFAULT.to_string(), representative)].into_iter().collect())
    }
}
