//! Composition root and inbound control surface.
//!
//! [`ExecutionService`] owns the long-lived collaborators (state store,
//! conversation memory, observer bus, prompt bus, handler registry) and
//! exposes the operations transports call: `execute`, `control`, `respond`
//! and `subscribe`. It also runs nested diagrams for `sub_diagram` nodes.

use crate::engine::{EngineConfig, ExecutionControl, ExecutionEngine};
use crate::events::ObserverBus;
use crate::handler::{Services, SubDiagramRunner};
use crate::observers::{StateStoreObserver, StreamingObserver, Subscription};
use crate::ports::{CodeRunner, FilePort, HttpPort, LlmClient};
use crate::prompts::PromptBus;
use crate::registry::HandlerRegistry;
use async_trait::async_trait;
use dashmap::DashMap;
use dipeo_conversation::ConversationStore;
use dipeo_core::diagram::Diagram;
use dipeo_core::envelope::Envelope;
use dipeo_core::error::ExecutionError;
use dipeo_core::ids::{DiagramId, ExecutionId, NodeId};
use dipeo_state::{ExecutionStatus, InMemoryStateStore, StateStore};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{error, info};

/// Options for one execution request.
#[derive(Clone, Debug, Default)]
pub struct ExecuteOptions {
    pub variables: HashMap<String, Value>,
    pub max_iterations: Option<u32>,
    pub timeout_s: Option<u64>,
    /// When false, `user_response` nodes resolve immediately with "".
    pub interactive: bool,
}

impl ExecuteOptions {
    pub fn interactive() -> Self {
        Self {
            interactive: true,
            ..Default::default()
        }
    }

    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }
}

/// Runtime control actions on an active execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlAction {
    Pause,
    Resume,
    Abort,
    SkipNode(NodeId),
}

pub struct ExecutionService {
    weak: Weak<ExecutionService>,
    registry: Arc<HandlerRegistry>,
    state_store: Arc<dyn StateStore>,
    conversation: Arc<ConversationStore>,
    prompts: Arc<PromptBus>,
    streaming: Arc<StreamingObserver>,
    persistence: Arc<StateStoreObserver>,
    observers: Arc<ObserverBus>,
    llm: Option<Arc<dyn LlmClient>>,
    http: Option<Arc<dyn HttpPort>>,
    files: Option<Arc<dyn FilePort>>,
    code: Option<Arc<dyn CodeRunner>>,
    config: EngineConfig,
    diagrams: DashMap<DiagramId, Arc<Diagram>>,
    controls: DashMap<ExecutionId, Arc<ExecutionControl>>,
}

#[derive(Default)]
pub struct ExecutionServiceBuilder {
    state_store: Option<Arc<dyn StateStore>>,
    registry: Option<Arc<HandlerRegistry>>,
    llm: Option<Arc<dyn LlmClient>>,
    http: Option<Arc<dyn HttpPort>>,
    files: Option<Arc<dyn FilePort>>,
    code: Option<Arc<dyn CodeRunner>>,
    config: Option<EngineConfig>,
}

impl ExecutionServiceBuilder {
    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn with_registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = Some(registry);
        self
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

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Arc<ExecutionService> {
        let state_store: Arc<dyn StateStore> = self
            .state_store
            .unwrap_or_else(|| Arc::new(InMemoryStateStore::new()));
        let persistence = Arc::new(StateStoreObserver::new(state_store.clone()));
        let streaming = Arc::new(StreamingObserver::new());
        let observers = Arc::new(ObserverBus::new(vec![
            persistence.clone(),
            streaming.clone(),
        ]));

        Arc::new_cyclic(|weak| ExecutionService {
            weak: weak.clone(),
            registry: self.registry.unwrap_or_else(|| Arc::new(HandlerRegistry::builtin())),
            state_store,
            conversation: Arc::new(ConversationStore::new()),
            prompts: Arc::new(PromptBus::new()),
            streaming,
            persistence,
            observers,
            llm: self.llm,
            http: self.http,
            files: self.files,
            code: self.code,
            config: self.config.unwrap_or_default(),
            diagrams: DashMap::new(),
            controls: DashMap::new(),
        })
    }
}

impl ExecutionService {
    pub fn builder() -> ExecutionServiceBuilder {
        ExecutionServiceBuilder::default()
    }

    pub fn state_store(&self) -> &Arc<dyn StateStore> {
        &self.state_store
    }

    pub fn conversation(&self) -> &Arc<ConversationStore> {
        &self.conversation
    }

    /// Make a diagram resolvable by `sub_diagram` nodes.
    pub fn register_diagram(&self, id: DiagramId, diagram: Arc<Diagram>) {
        self.diagrams.insert(id, diagram);
    }

    fn services(&self) -> Arc<Services> {
        let mut services = Services::new(
            self.conversation.clone(),
            self.prompts.clone(),
            self.observers.clone(),
        );
        if let Some(llm) = &self.llm {
            services = services.with_llm(llm.clone());
        }
        if let Some(http) = &self.http {
            services = services.with_http(http.clone());
        }
        if let Some(files) = &self.files {
            services = services.with_files(files.clone());
        }
        if let Some(code) = &self.code {
            services = services.with_code(code.clone());
        }
        if let Some(strong) = self.weak.upgrade() {
            services = services.with_sub_runner(strong as Arc<dyn SubDiagramRunner>);
        }
        Arc::new(services)
    }

    fn engine_config(&self, options: &ExecuteOptions) -> EngineConfig {
        let mut config = self.config.clone();
        if let Some(max_iterations) = options.max_iterations {
            config.max_iterations = max_iterations;
        }
        if let Some(timeout_s) = options.timeout_s {
            config.execution_timeout = Duration::from_secs(timeout_s);
        }
        config.interactive = options.interactive;
        config
    }

    fn build_engine(&self, diagram: Arc<Diagram>, options: &ExecuteOptions) -> ExecutionEngine {
        ExecutionEngine::new(
            diagram,
            self.registry.clone(),
            self.services(),
            self.state_store.clone(),
            self.observers.clone(),
            self.engine_config(options),
        )
        .with_persistence_health(self.persistence.clone())
    }

    /// Start an execution; returns immediately with its id.
    pub fn execute(
        self: &Arc<Self>,
        diagram: Arc<Diagram>,
        options: ExecuteOptions,
    ) -> Result<ExecutionId, ExecutionError> {
        let execution_id = ExecutionId::generate();
        self.spawn_execution(execution_id.clone(), diagram, options)?;
        Ok(execution_id)
    }

    /// Start an execution with a subscription opened before the first
    /// event, guaranteeing a complete stream.
    pub fn execute_with_subscription(
        self: &Arc<Self>,
        diagram: Arc<Diagram>,
        options: ExecuteOptions,
    ) -> Result<(ExecutionId, Subscription), ExecutionError> {
        let execution_id = ExecutionId::generate();
        let subscription = self.streaming.subscribe(&execution_id);
        self.spawn_execution(execution_id.clone(), diagram, options)?;
        Ok((execution_id, subscription))
    }

    fn spawn_execution(
        self: &Arc<Self>,
        execution_id: ExecutionId,
        diagram: Arc<Diagram>,
        options: ExecuteOptions,
    ) -> Result<(), ExecutionError> {
        // Fail fast before spawning anything.
        self.registry.check_requirements(&diagram, &self.services())?;

        let control = Arc::new(ExecutionControl::new());
        self.controls.insert(execution_id.clone(), control.clone());

        let engine = self.build_engine(diagram, &options).with_control(control);
        let service = self.clone();
        let id = execution_id.clone();
        let variables = options.variables;

        info!(execution = %execution_id, "starting execution");
        tokio::spawn(async move {
            if let Err(err) = engine.run(id.clone(), variables).await {
                error!(execution = %id, error = %err, "execution run failed");
            }
            service.controls.remove(&id);
        });
        Ok(())
    }

    /// Pause, resume, abort, or skip a node of an active execution.
    pub fn control(&self, execution_id: &ExecutionId, action: ControlAction) -> Result<(), ExecutionError> {
        let control = self.controls.get(execution_id).ok_or_else(|| {
            ExecutionError::NotFound(format!("active execution '{}'", execution_id))
        })?;
        match action {
            ControlAction::Pause => control.pause(),
            ControlAction::Resume => control.resume(),
            ControlAction::Abort => control.abort(),
            ControlAction::SkipNode(node_id) => control.request_skip(node_id),
        }
        Ok(())
    }

    /// Answer a pending interactive prompt. Returns false when nothing was
    /// waiting for `(execution, node)`.
    pub fn respond(&self, execution_id: &ExecutionId, node_id: &NodeId, response: String) -> bool {
        self.prompts.resolve_input(execution_id, node_id, response)
    }

    /// Subscribe to an execution's live event stream.
    pub fn subscribe(&self, execution_id: &ExecutionId) -> Subscription {
        self.streaming.subscribe(execution_id)
    }
}

#[async_trait]
impl SubDiagramRunner for ExecutionService {
    async fn run_sub_diagram(
        &self,
        diagram_id: &DiagramId,
        variables: HashMap<String, Value>,
        parent_execution: &ExecutionId,
    ) -> Result<Envelope, ExecutionError> {
        let diagram = self
            .diagrams
            .get(diagram_id)
            .map(|d| d.clone())
            .ok_or_else(|| ExecutionError::NotFound(format!("diagram '{}'", diagram_id)))?;

        let child_id = ExecutionId::new(format!(
            "{}:{}",
            parent_execution,
            uuid::Uuid::new_v4().simple()
        ));
        info!(parent = %parent_execution, child = %child_id, diagram = %diagram_id, "running sub-diagram");

        let engine = self.build_engine(diagram.clone(), &ExecuteOptions::default());
        let state = engine.run(child_id, variables).await?;

        if state.status != ExecutionStatus::Completed {
            return Err(ExecutionError::State(format!(
                "sub-diagram execution ended with status '{}'",
                state.status.as_str()
            )));
        }

        for endpoint in diagram.endpoint_nodes() {
            if let Some(envelope) = state.node_outputs.get(&endpoint.id) {
                return Ok(envelope.clone());
            }
        }
        Ok(state
            .node_outputs
            .values()
            .next()
            .cloned()
            .unwrap_or_else(|| Envelope::empty(NodeId::new("sub_diagram"))))
    }
}
