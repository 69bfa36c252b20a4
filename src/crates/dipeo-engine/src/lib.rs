//! # dipeo-engine - Stateful diagram execution
//!
//! The engine turns a compiled diagram (see `dipeo-core`) into a running,
//! observable, resumable computation:
//!
//! - **Step loop** ([`engine`]) - readiness-driven scheduling with bounded
//!   parallelism, per-node timeouts, retry on transient failures, loop
//!   re-entry via epochs, pause/skip/abort, and deadlock detection
//! - **Handlers** ([`handler`], [`handlers`], [`registry`]) - one handler
//!   per node type behind an explicit registry; built-ins cover `start`,
//!   `endpoint`, `condition`, `person_job`, `code_job`, `api_job`, `db`,
//!   `user_response` and `sub_diagram`
//! - **Observer bus** ([`events`], [`observers`]) - lifecycle events fanned
//!   out to the state registry and to live streaming subscribers
//! - **Interactive prompts** ([`prompts`]) - one-shot futures keyed by
//!   `(execution, node)`, resolving empty on timeout
//! - **Collaborator ports** ([`ports`]) - LLM / HTTP / file / code traits
//!   the embedding application implements
//! - **Service facade** ([`service`]) - `execute` / `control` / `respond` /
//!   `subscribe`, the surface transports build on
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use dipeo_core::diagram::{DiagramBuilder, Node, NodeType};
//! use dipeo_engine::service::{ExecutionService, ExecuteOptions};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), dipeo_core::error::ExecutionError> {
//! let diagram = Arc::new(
//!     DiagramBuilder::new()
//!         .node(Node::new("start", NodeType::Start))
//!         .node(Node::new("done", NodeType::Endpoint))
//!         .edge("start", "default", "done", "default")
//!         .build()?,
//! );
//!
//! let service = ExecutionService::builder().build();
//! let (execution_id, mut events) =
//!     service.execute_with_subscription(diagram, ExecuteOptions::default())?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{}: {:?}", execution_id, event.event_type);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod engine;
pub mod events;
pub mod handler;
pub mod handlers;
pub mod observers;
pub mod ports;
pub mod prompts;
pub mod registry;
pub mod service;

pub use cancel::CancelToken;
pub use engine::{EngineConfig, ExecutionControl, ExecutionEngine};
pub use events::{EventType, ExecutionEvent, ExecutionObserver, ObserverBus};
pub use handler::{HandlerContext, NodeHandler, Services, SubDiagramRunner};
pub use observers::{StateStoreObserver, StreamingObserver, Subscription};
pub use ports::{
    CodeRunner, FilePort, HttpPort, HttpRequest, HttpResponse, LlmClient, LlmRequest, LlmResponse,
    LocalFilePort, StubLlm,
};
pub use prompts::PromptBus;
pub use registry::HandlerRegistry;
pub use service::{ControlAction, ExecuteOptions, ExecutionService, ExecutionServiceBuilder};
