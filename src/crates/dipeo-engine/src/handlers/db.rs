//! `db` nodes do file-backed reads and writes through the file port.
//!
//! Config (`extra`): `operation` in {`read`, `write`, `append`} (default
//! `read`) and `path`.

use super::{body_to_string, extra_str};
use crate::handler::{HandlerContext, NodeHandler};
use async_trait::async_trait;
use dipeo_core::diagram::{Node, NodeType};
use dipeo_core::envelope::{Envelope, PortMap, PORT_DEFAULT};
use dipeo_core::error::ExecutionError;

pub struct DbHandler;

#[async_trait]
impl NodeHandler for DbHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Db
    }

    fn required_services(&self) -> &'static [&'static str] {
        &["files"]
    }

    fn validate_config(&self, node: &Node) -> Result<(), ExecutionError> {
        if extra_str(&node.config.extra, "path").is_none() {
            return Err(ExecutionError::Validation(format!(
                "db node '{}' is missing 'path' config",
                node.id
            )));
        }
        let operation = extra_str(&node.config.extra, "operation").unwrap_or("read");
        if !matches!(operation, "read" | "write" | "append") {
            return Err(ExecutionError::Validation(format!(
                "db node '{}' has unsupported operation '{}'",
                node.id, operation
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
        let path = extra_str(&node.config.extra, "path").ok_or_else(|| {
            ExecutionError::handler(node.id.clone(), "db node is missing 'path' config")
        })?;
        let operation = extra_str(&node.config.extra, "operation").unwrap_or("read");
        let files = ctx.files()?;

        let content = match operation {
            "read" => files.read(path).await?,
            "write" => {
                let content = inputs
                    .get(PORT_DEFAULT)
                    .map(body_to_string)
                    .unwrap_or_default();
                files.write(path, &content).await?;
                content
            }
            "append" => {
                let existing = match files.read(path).await {
                    Ok(existing) => existing,
                    Err(ExecutionError::NotFound(_)) => String::new(),
                    Err(e) => return Err(e),
                };
                let addition = inputs
                    .get(PORT_DEFAULT)
                    .map(body_to_string)
                    .unwrap_or_default();
                let combined = format!("{}{}", existing, addition);
                files.write(path, &combined).await?;
                combined
            }
            other => {
                return Err(ExecutionError::handler(
                    node.id.clone(),
                    format!("unsupported db operation '{}'", other),
                ))
            }
        };

        let envelope =
            Envelope::text(node.id.clone(), content).with_trace_id(ctx.execution_id.as_str());
        Ok([(PORT_DEFAULT.to_string(), envelope)].into_iter().collect())
    }
}
