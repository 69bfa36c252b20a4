//! Built-in node handlers.

mod api_job;
mod code_job;
mod condition;
mod db;
mod endpoint;
mod person_job;
mod start;
mod sub_diagram;
mod user_response;

pub use api_job::ApiJobHandler;
pub use code_job::CodeJobHandler;
pub use condition::ConditionHandler;
pub use db::DbHandler;
pub use endpoint::EndpointHandler;
pub use person_job::PersonJobHandler;
pub use start::StartHandler;
pub use sub_diagram::SubDiagramHandler;
pub use user_response::UserResponseHandler;

use dipeo_core::envelope::{Envelope, EnvelopeBody, PortMap};
use serde_json::Value;
use std::collections::HashMap;

/// Render `{name}` placeholders from a variable map. Unknown placeholders
/// are left untouched; string values substitute raw, everything else as
/// JSON.
pub(crate) fn render_template(template: &str, vars: &HashMap<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                match vars.get(name) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(value) => out.push_str(&value.to_string()),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Variables merged with inbound envelopes (port name -> body value), the
/// inputs winning on key collisions.
pub(crate) fn template_vars(
    variables: &HashMap<String, Value>,
    inputs: &PortMap,
) -> HashMap<String, Value> {
    let mut merged = variables.clone();
    for (port, envelope) in inputs {
        merged.insert(port.clone(), envelope.body.to_value());
    }
    merged
}

/// Render an envelope body for text-oriented sinks.
pub(crate) fn body_to_string(envelope: &Envelope) -> String {
    match &envelope.body {
        EnvelopeBody::Text(s) => s.clone(),
        EnvelopeBody::Json(v) => match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
        EnvelopeBody::Binary(b) => format!("<{} bytes>", b.len()),
        EnvelopeBody::Empty => String::new(),
    }
}

/// Read a string field from a node's `extra` config.
pub(crate) fn extra_str<'a>(extra: &'a Value, key: &str) -> Option<&'a str> {
    extra.get(key).and_then(Value::as_str)
}
