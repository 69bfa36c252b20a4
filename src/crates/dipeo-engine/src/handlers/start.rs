//! `start` nodes emit the execution variables exactly once.

use crate::handler::{HandlerContext, NodeHandler};
use async_trait::async_trait;
use dipeo_core::diagram::{Node, NodeType};
use dipeo_core::envelope::{Envelope, PortMap, PORT_DEFAULT};
use dipeo_core::error::ExecutionError;
use serde_json::Value;

pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Start
    }

    async fn execute(
        &self,
        node: &Node,
        _inputs: PortMap,
        ctx: &HandlerContext,
    ) -> Result<PortMap, ExecutionError> {
        let variables: serde_json::Map<String, Value> =
            ctx.variables_snapshot().into_iter().collect();
        let envelope = Envelope::json(node.id.clone(), Value::Object(variables))
            .with_trace_id(ctx.execution_id.as_str());
        Ok([(PORT_DEFAULT.to_string(), envelope)].into_iter().collect())
    }
}
