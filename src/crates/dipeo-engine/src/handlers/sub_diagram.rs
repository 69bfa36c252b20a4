//! `sub_diagram` nodes execute a nested diagram.
//!
//! Config (`extra`): `diagram_id` (required) and an optional `variables`
//! object merged over the parent's variables. Child failures surface as
//! deterministic handler failures; cancellation propagates.

use super::extra_str;
use crate::handler::{HandlerContext, NodeHandler};
use async_trait::async_trait;
use dipeo_core::diagram::{Node, NodeType};
use dipeo_core::envelope::{PortMap, PORT_DEFAULT};
use dipeo_core::error::{ErrorKind, ExecutionError};
use dipeo_core::ids::DiagramId;
use serde_json::Value;

pub struct SubDiagramHandler;

#[async_trait]
impl NodeHandler for SubDiagramHandler {
    fn node_type(&self) -> NodeType {
        NodeType::SubDiagram
    }

    fn required_services(&self) -> &'static [&'static str] {
        &["sub_runner"]
    }

    fn validate_config(&self, node: &Node) -> Result<(), ExecutionError> {
        if extra_str(&node.config.extra, "diagram_id").is_none() {
            return Err(ExecutionError::Validation(format!(
                "sub_diagram node '{}' is missing 'diagram_id' config",
                node.id
            )));
        }
        Ok(())
    }

    async fn execute(
        &self,
        node: &Node,
        _inputs: PortMap,
        ctx: &HandlerContext,
    ) -> Result<PortMap, ExecutionError> {
        let diagram_id = DiagramId::new(extra_str(&node.config.extra, "diagram_id").ok_or_else(
            || ExecutionError::handler(node.id.clone(), "sub_diagram is missing 'diagram_id' config"),
        )?);

        let mut variables = ctx.variables_snapshot();
        if let Some(Value::Object(overrides)) = node.config.extra.get("variables") {
            for (key, value) in overrides {
                variables.insert(key.clone(), value.clone());
            }
        }

        let child_output = ctx
            .sub_runner()?
            .run_sub_diagram(&diagram_id, variables, &ctx.execution_id)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::Cancelled => e,
                _ => ExecutionError::handler(
                    node.id.clone(),
                    format!("sub-diagram '{}' failed: {}", diagram_id, e),
                ),
            })?;

        let mut envelope = child_output;
        envelope.produced_by = node.id.clone();
        envelope.trace_id = ctx.execution_id.as_str().to_string();
        // Usage was accounted in the child execution's totals.
        envelope.meta.llm_usage = None;
        Ok([(PORT_DEFAULT.to_string(), envelope)].into_iter().collect())
    }
}
