//! # dipeo-core - Diagram model and token-flow scheduling
//!
//! Foundation crate for the DiPeO execution substrate. An *agentic diagram*
//! is a directed graph of typed nodes (LLM calls, code jobs, HTTP calls,
//! conditions, user prompts, sub-diagrams) connected by typed edges. This
//! crate provides everything the engine needs to reason about such a diagram
//! without running it:
//!
//! - **Compiled diagram model** - nodes, edges, person (LLM agent)
//!   definitions, structural validation and join-policy derivation
//! - **Envelopes** - the immutable value packets that flow along edges,
//!   carrying a body plus metadata (timing, retries, LLM token usage)
//! - **Token flow** - per-edge sequence-numbered tokens, epoch management
//!   for cyclic regions, consumption watermarks and branch decisions
//! - **Readiness evaluation** - join policies (`all`, `any`, `first`,
//!   `k_of_n`) combined with start-edge filtering, skippable conditions and
//!   branch filtering
//! - **Retry policies** - constant/linear/exponential/fibonacci backoff with
//!   jitter, shared by the engine and node handlers
//! - **Error taxonomy** - [`ExecutionError`] kinds the engine classifies for
//!   retry/abort decisions
//!
//! ## Token flow in one paragraph
//!
//! Producing nodes address their outputs to *ports* (`default`, `condtrue`,
//! `condfalse`, ...). The [`TokenManager`](tokens::TokenManager) routes each
//! port to the outgoing edges whose `source_output` matches and publishes a
//! [`Token`](tokens::Token) with a per-`(edge, epoch)` sequence number.
//! Consumers atomically drain unconsumed tokens via `consume_inbound`, which
//! advances a watermark so a token is observed at most once. Loop re-entry
//! is modelled by *epochs*: a new epoch gets fresh sequences and fresh
//! branch decisions, so one loop iteration cannot observe the previous
//! iteration's state.
//!
//! ## Quick start
//!
//! ```rust
//! use dipeo_core::diagram::{DiagramBuilder, Node, NodeType};
//! use dipeo_core::tokens::TokenManager;
//! use dipeo_core::envelope::{Envelope, PortMap};
//! use std::sync::Arc;
//!
//! let diagram = DiagramBuilder::new()
//!     .node(Node::new("start", NodeType::Start))
//!     .node(Node::new("work", NodeType::CodeJob))
//!     .edge("start", "default", "work", "default")
//!     .build()
//!     .unwrap();
//!
//! let diagram = Arc::new(diagram);
//! let tokens = TokenManager::new(diagram.clone());
//!
//! let start = diagram.node_id("start").unwrap();
//! let outputs: PortMap = [("default".to_string(), Envelope::text(start.clone(), "hello"))]
//!     .into_iter()
//!     .collect();
//! tokens.emit_outputs(&start, &outputs, None);
//!
//! let work = diagram.node_id("work").unwrap();
//! let inputs = tokens.consume_inbound(&work, None);
//! assert_eq!(inputs["default"].body.as_text(), Some("hello"));
//! ```

pub mod diagram;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod retry;
pub mod tokens;
pub mod usage;

pub use diagram::{
    Diagram, DiagramBuilder, Edge, EdgeRef, ErrorAction, JoinPolicy, Node, NodeConfig, NodeType,
    PersonSpec,
};
pub use envelope::{
    ContentType, Envelope, EnvelopeBody, EnvelopeMeta, PortMap, PORT_CONDFALSE, PORT_CONDTRUE,
    PORT_CONVERSATION, PORT_DEFAULT,
};
pub use error::{ErrorKind, ExecutionError, FailureDetail, Result};
pub use ids::{ApiKeyId, ArrowId, DiagramId, ExecutionId, HandleId, NodeId, PersonId};
pub use retry::{RetryPolicy, RetryStrategy};
pub use tokens::{BranchDecision, Token, TokenManager};
pub use usage::TokenUsage;
