//! `api_job` nodes call the HTTP port.
//!
//! Rate limits and 5xx responses surface as `Transient` so the engine's
//! retry policy applies; other non-success statuses are deterministic
//! handler failures.

use super::{extra_str, render_template, template_vars};
use crate::handler::{HandlerContext, NodeHandler};
use crate::ports::HttpRequest;
use async_trait::async_trait;
use dipeo_core::diagram::{Node, NodeType};
use dipeo_core::envelope::{Envelope, PortMap, PORT_DEFAULT};
use dipeo_core::error::ExecutionError;
use serde_json::{json, Value};
use std::collections::HashMap;

pub struct ApiJobHandler;

#[async_trait]
impl NodeHandler for ApiJobHandler {
    fn node_type(&self) -> NodeType {
        NodeType::ApiJob
    }

    fn required_services(&self) -> &'static [&'static str] {
        &["http"]
    }

    fn validate_config(&self, node: &Node) -> Result<(), ExecutionError> {
        if extra_str(&node.config.extra, "url").is_none() {
            return Err(ExecutionError::Validation(format!(
                "api_job node '{}' is missing 'url' config",
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
        let url_template = extra_str(&node.config.extra, "url").ok_or_else(|| {
            ExecutionError::handler(node.id.clone(), "api_job is missing 'url' config")
        })?;
        let vars = template_vars(&ctx.variables_snapshot(), &inputs);

        let headers: HashMap<String, String> = node
            .config
            .extra
            .get("headers")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let request = HttpRequest {
            method: extra_str(&node.config.extra, "method").unwrap_or("GET").to_string(),
            url: render_template(url_template, &vars),
            headers,
            body: node.config.extra.get("body").cloned(),
            timeout_s: node.config.extra.get("timeout_s").and_then(Value::as_u64),
        };

        let response = ctx.http()?.request(request).await?;

        if response.status == 429 || response.status >= 500 {
            return Err(ExecutionError::Transient(format!(
                "api_job got status {}",
                response.status
            )));
        }
        if response.status >= 400 {
            return Err(ExecutionError::handler(
                node.id.clone(),
                format!("api_job got status {}", response.status),
            ));
        }

        let envelope = Envelope::json(
            node.id.clone(),
            json!({ "status": response.status, "body": response.body }),
        )
        .with_trace_id(ctx.execution_id.as_str());
        Ok([(PORT_DEFAULT.to_string(), envelope)].into_iter().collect())
    }
}
