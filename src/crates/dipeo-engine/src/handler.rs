//! The node-handler seam.
//!
//! Every node type resolves to exactly one [`NodeHandler`] through the
//! registry. Handlers receive their validated node, the inbound envelopes
//! keyed by port, and a [`HandlerContext`] exposing the read-only diagram,
//! the shared variable map, collaborator ports and the cancellation token.
//! Retry and skip decisions live in the engine, not in handlers: a handler
//! reports *what* failed via [`ExecutionError`] kinds and the engine
//! decides what to do about it.

use crate::cancel::CancelToken;
use crate::events::ObserverBus;
use crate::ports::{CodeRunner, FilePort, HttpPort, LlmClient};
use crate::prompts::PromptBus;
use async_trait::async_trait;
use dipeo_conversation::ConversationStore;
use dipeo_core::diagram::{Diagram, Node, NodeType};
use dipeo_core::envelope::{Envelope, PortMap};
use dipeo_core::error::ExecutionError;
use dipeo_core::ids::{DiagramId, ExecutionId, NodeId};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Runs a nested diagram on behalf of a `sub_diagram` node and returns the
/// child execution's representative output.
#[async_trait]
pub trait SubDiagramRunner: Send + Sync {
    async fn run_sub_diagram(
        &self,
        diagram_id: &DiagramId,
        variables: HashMap<String, Value>,
        parent_execution: &ExecutionId,
    ) -> Result<Envelope, ExecutionError>;
}

/// Collaborators shared by every handler of an execution.
pub struct Services {
    pub llm: Option<Arc<dyn LlmClient>>,
    pub http: Option<Arc<dyn HttpPort>>,
    pub files: Option<Arc<dyn FilePort>>,
    pub code: Option<Arc<dyn CodeRunner>>,
    pub sub_runner: Option<Arc<dyn SubDiagramRunner>>,
    pub conversation: Arc<ConversationStore>,
    pub prompts: Arc<PromptBus>,
    pub observers: Arc<ObserverBus>,
}

impl Services {
    pub fn new(
        conversation: Arc<ConversationStore>,
        prompts: Arc<PromptBus>,
        observers: Arc<ObserverBus>,
    ) -> Self {
        Self {
            llm: None,
            http: None,
            files: None,
            code: None,
            sub_runner: None,
            conversation,
            prompts,
            observers,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_http(mut self, http: Arc<dyn HttpPort>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn with_files(mut self, files: Arc<dyn FilePort>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn with_code(mut self, code: Arc<dyn CodeRunner>) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_sub_runner(mut self, runner: Arc<dyn SubDiagramRunner>) -> Self {
        self.sub_runner = Some(runner);
        self
    }

    /// Whether a named collaborator is wired in. Names match
    /// [`NodeHandler::required_services`].
    pub fn has(&self, name: &str) -> bool {
        match name {
            "llm" => self.llm.is_some(),
            "http" => self.http.is_some(),
            "files" => self.files.is_some(),
            "code" => self.code.is_some(),
            "sub_runner" => self.sub_runner.is_some(),
            _ => false,
        }
    }
}

/// Everything a handler can see and touch during one node dispatch.
#[derive(Clone)]
pub struct HandlerContext {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    /// Epoch the node's inputs were consumed at.
    pub epoch: u64,
    /// How many times this node completed before the current run.
    pub exec_count: u32,
    /// When false, interactive prompts resolve immediately with "".
    pub interactive: bool,
    pub diagram: Arc<Diagram>,
    pub variables: Arc<RwLock<HashMap<String, Value>>>,
    pub services: Arc<Services>,
    pub cancel: CancelToken,
    /// Effective timeout for this node's work.
    pub node_timeout: Duration,
    prompt_waiters: Arc<AtomicUsize>,
}

impl HandlerContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        execution_id: ExecutionId,
        node_id: NodeId,
        epoch: u64,
        exec_count: u32,
        interactive: bool,
        diagram: Arc<Diagram>,
        variables: Arc<RwLock<HashMap<String, Value>>>,
        services: Arc<Services>,
        cancel: CancelToken,
        node_timeout: Duration,
        prompt_waiters: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            execution_id,
            node_id,
            epoch,
            exec_count,
            interactive,
            diagram,
            variables,
            services,
            cancel,
            node_timeout,
            prompt_waiters,
        }
    }

    pub fn variables_snapshot(&self) -> HashMap<String, Value> {
        self.variables.read().clone()
    }

    pub fn set_variable(&self, key: impl Into<String>, value: Value) {
        self.variables.write().insert(key.into(), value);
    }

    pub fn conversation(&self) -> &Arc<ConversationStore> {
        &self.services.conversation
    }

    pub fn llm(&self) -> Result<&Arc<dyn LlmClient>, ExecutionError> {
        self.services
            .llm
            .as_ref()
            .ok_or_else(|| ExecutionError::Validation("llm client not configured".into()))
    }

    pub fn http(&self) -> Result<&Arc<dyn HttpPort>, ExecutionError> {
        self.services
            .http
            .as_ref()
            .ok_or_else(|| ExecutionError::Validation("http port not configured".into()))
    }

    pub fn files(&self) -> Result<&Arc<dyn FilePort>, ExecutionError> {
        self.services
            .files
            .as_ref()
            .ok_or_else(|| ExecutionError::Validation("file port not configured".into()))
    }

    pub fn code(&self) -> Result<&Arc<dyn CodeRunner>, ExecutionError> {
        self.services
            .code
            .as_ref()
            .ok_or_else(|| ExecutionError::Validation("code runner not configured".into()))
    }

    pub fn sub_runner(&self) -> Result<&Arc<dyn SubDiagramRunner>, ExecutionError> {
        self.services
            .sub_runner
            .as_ref()
            .ok_or_else(|| ExecutionError::Validation("sub-diagram runner not configured".into()))
    }

    /// Emit a `node_progress` event for this node.
    pub async fn progress(&self, message: &str) {
        self.services
            .observers
            .node_progress(&self.execution_id, &self.node_id, message)
            .await;
    }

    /// Suspend on an interactive prompt. The wait does not count against
    /// the engine's parallelism budget; a timeout resolves with an empty
    /// string rather than an error. Non-interactive executions resolve
    /// immediately with "".
    pub async fn request_input(
        &self,
        prompt: &str,
        context: Value,
        timeout: Duration,
    ) -> Result<String, ExecutionError> {
        if !self.interactive {
            return Ok(String::new());
        }
        self.prompt_waiters.fetch_add(1, Ordering::SeqCst);
        let result = self
            .services
            .prompts
            .request_input(
                &self.services.observers,
                &self.execution_id,
                &self.node_id,
                prompt,
                context,
                timeout,
                &self.cancel,
            )
            .await;
        self.prompt_waiters.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// One node type's execution logic.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// The node type this handler serves.
    fn node_type(&self) -> NodeType;

    /// Collaborator ports that must be wired for this handler to run.
    /// Checked once per execution before the first step.
    fn required_services(&self) -> &'static [&'static str] {
        &[]
    }

    /// Validate a node's config before the execution starts. Runs once per
    /// node during the pre-flight check, so config mistakes surface as a
    /// `Validation` error instead of a mid-run node failure.
    fn validate_config(&self, _node: &Node) -> Result<(), ExecutionError> {
        Ok(())
    }

    /// Execute the node. `inputs` holds the consumed inbound envelopes by
    /// target port; the returned map addresses output ports.
    async fn execute(
        &self,
        node: &Node,
        inputs: PortMap,
        ctx: &HandlerContext,
    ) -> Result<PortMap, ExecutionError>;
}
