//! Envelopes - the immutable data packets that flow along edges.
//!
//! An envelope is produced once by a node, addressed to one of the node's
//! output *ports* (`default`, `condtrue`, `condfalse`, ...), and never
//! mutated afterwards. Routing from ports to edges is the token manager's
//! job; the envelope itself knows nothing about edges.
//!
//! # Example
//!
//! ```rust
//! use dipeo_core::envelope::Envelope;
//! use dipeo_core::ids::NodeId;
//! use dipeo_core::usage::TokenUsage;
//!
//! let env = Envelope::text(NodeId::new("llm_1"), "hello world")
//!     .with_usage(TokenUsage::new(12, 4));
//!
//! assert_eq!(env.body.as_text(), Some("hello world"));
//! assert_eq!(env.meta.llm_usage.as_ref().unwrap().total, 16);
//! ```

use crate::ids::NodeId;
use crate::usage::TokenUsage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// The default output/input port name.
pub const PORT_DEFAULT: &str = "default";

/// Output port of a condition node taking the true branch.
pub const PORT_CONDTRUE: &str = "condtrue";

/// Output port of a condition node taking the false branch.
pub const PORT_CONDFALSE: &str = "condfalse";

/// Port carrying a person's conversation state across
/// [`ContentType::ConversationState`] edges.
pub const PORT_CONVERSATION: &str = "conversation";

/// Map of port name to envelope, used for both node inputs and outputs.
pub type PortMap = HashMap<String, Envelope>;

/// Declared content type of an edge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    RawText,
    Object,
    ConversationState,
}

/// Envelope payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeBody {
    Text(String),
    Json(Value),
    Binary(Vec<u8>),
    Empty,
}

impl EnvelopeBody {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            EnvelopeBody::Text(s) => Some(s),
            EnvelopeBody::Json(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            EnvelopeBody::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, EnvelopeBody::Empty)
    }

    /// Render the body as a JSON value, lossy for binary payloads.
    pub fn to_value(&self) -> Value {
        match self {
            EnvelopeBody::Text(s) => Value::String(s.clone()),
            EnvelopeBody::Json(v) => v.clone(),
            EnvelopeBody::Binary(b) => Value::String(format!("<{} bytes>", b.len())),
            EnvelopeBody::Empty => Value::Null,
        }
    }

    /// Approximate in-memory size, used for the large-payload spill rule.
    pub fn size_hint(&self) -> usize {
        match self {
            EnvelopeBody::Text(s) => s.len(),
            EnvelopeBody::Json(v) => serde_json::to_string(v).map(|s| s.len()).unwrap_or(0),
            EnvelopeBody::Binary(b) => b.len(),
            EnvelopeBody::Empty => 0,
        }
    }
}

/// Metadata attached to an envelope.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Reference into the message store when the body was spilled out of
    /// the execution row (large-payload rule).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_ref: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, Value>,
}

/// An immutable value packet addressed to an output port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub trace_id: String,
    pub produced_by: NodeId,
    pub content_type: ContentType,
    pub body: EnvelopeBody,
    #[serde(default)]
    pub meta: EnvelopeMeta,
}

impl Envelope {
    fn with_body(produced_by: NodeId, content_type: ContentType, body: EnvelopeBody) -> Self {
        Self {
            id: format!("env_{}", uuid::Uuid::new_v4().simple()),
            trace_id: String::new(),
            produced_by,
            content_type,
            body,
            meta: EnvelopeMeta::default(),
        }
    }

    pub fn text(produced_by: NodeId, body: impl Into<String>) -> Self {
        Self::with_body(produced_by, ContentType::RawText, EnvelopeBody::Text(body.into()))
    }

    pub fn json(produced_by: NodeId, body: Value) -> Self {
        Self::with_body(produced_by, ContentType::Object, EnvelopeBody::Json(body))
    }

    pub fn binary(produced_by: NodeId, body: Vec<u8>) -> Self {
        Self::with_body(produced_by, ContentType::RawText, EnvelopeBody::Binary(body))
    }

    pub fn empty(produced_by: NodeId) -> Self {
        Self::with_body(produced_by, ContentType::RawText, EnvelopeBody::Empty)
    }

    pub fn conversation(produced_by: NodeId, body: Value) -> Self {
        Self::with_body(produced_by, ContentType::ConversationState, EnvelopeBody::Json(body))
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.meta.llm_usage = Some(usage);
        self
    }

    pub fn with_execution_time(mut self, millis: u64) -> Self {
        self.meta.execution_time_ms = Some(millis);
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.meta.retry_count = Some(retries);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.meta.error = Some(error.into());
        self
    }

    pub fn with_meta_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.extra.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_envelope() {
        let env = Envelope::text(NodeId::new("a"), "payload");
        assert_eq!(env.content_type, ContentType::RawText);
        assert_eq!(env.body.as_text(), Some("payload"));
        assert!(env.id.starts_with("env_"));
    }

    #[test]
    fn test_json_body_accessors() {
        let env = Envelope::json(NodeId::new("a"), json!({"result": true}));
        assert_eq!(env.content_type, ContentType::Object);
        assert_eq!(env.body.as_json().unwrap()["result"], json!(true));
        assert_eq!(env.body.as_text(), None);
    }

    #[test]
    fn test_empty_body() {
        let env = Envelope::empty(NodeId::new("a"));
        assert!(env.body.is_empty());
        assert_eq!(env.body.to_value(), Value::Null);
    }

    #[test]
    fn test_meta_builders() {
        let env = Envelope::text(NodeId::new("a"), "x")
            .with_usage(TokenUsage::new(3, 2))
            .with_execution_time(17)
            .with_retry_count(1);
        assert_eq!(env.meta.llm_usage.as_ref().unwrap().total, 5);
        assert_eq!(env.meta.execution_time_ms, Some(17));
        assert_eq!(env.meta.retry_count, Some(1));
    }

    #[test]
    fn test_serde_round_trip() {
        let env = Envelope::json(NodeId::new("n1"), json!({"k": [1, 2, 3]}))
            .with_usage(TokenUsage::new(1, 2));
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_size_hint() {
        let env = Envelope::text(NodeId::new("a"), "12345");
        assert_eq!(env.body.size_hint(), 5);
        assert_eq!(Envelope::empty(NodeId::new("a")).body.size_hint(), 0);
    }
}
