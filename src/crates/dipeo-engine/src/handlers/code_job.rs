//! `code_job` nodes delegate to the injected code-runner port.

use super::extra_str;
use crate::handler::{HandlerContext, NodeHandler};
use async_trait::async_trait;
use dipeo_core::diagram::{Node, NodeType};
use dipeo_core::envelope::{Envelope, PortMap, PORT_DEFAULT};
use dipeo_core::error::ExecutionError;
use serde_json::{json, Map, Value};

pub struct CodeJobHandler;

#[async_trait]
impl NodeHandler for CodeJobHandler {
    fn node_type(&self) -> NodeType {
        NodeType::CodeJob
    }

    fn required_services(&self) -> &'static [&'static str] {
        &["code"]
    }

    fn validate_config(&self, node: &Node) -> Result<(), ExecutionError> {
        if extra_str(&node.config.extra, "code").is_none() {
            return Err(ExecutionError::Validation(format!(
                "code_job node '{}' is missing 'code' config",
                node.id
            )));
        }
        Ok(())
    }

    async fn execute(
        &self,
        node: &Node,
        inputs: PortMap,
        ctx: &HandlerContext,
    ) -> Result<PortMap, ExecutionError> {
        let code = extra_str(&node.config.extra, "code").ok_or_else(|| {
            ExecutionError::handler(node.id.clone(), "code_job is missing 'code' config")
        })?;
        let language = extra_str(&node.config.extra, "language").unwrap_or("python");

        let ports: Map<String, Value> = inputs
            .iter()
            .map(|(port, envelope)| (port.clone(), envelope.body.to_value()))
            .collect();
        let variables: Map<String, Value> = ctx.variables_snapshot().into_iter().collect();
        let payload = json!({ "inputs": ports, "variables": variables });

        let result = ctx.code()?.run(language, code, &payload).await?;

        let envelope =
            Envelope::json(node.id.clone(), result).with_trace_id(ctx.execution_id.as_str());
        Ok([(PORT_DEFAULT.to_string(), envelope)].into_iter().collect())
    }
}
