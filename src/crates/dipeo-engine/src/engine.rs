//! The stateful execution engine.
//!
//! One engine drives one execution as a sequence of steps: ask the token
//! manager which nodes are ready, dispatch up to `max_parallel_nodes` of
//! them as tasks, process completions as they land, and route outputs back
//! into the token manager. The driver task is the only writer of
//! scheduling state; node handlers only see their own context.
//!
//! Termination:
//! - every reachable endpoint satisfied and nothing runnable -> `completed`
//! - ready set empty, nothing in flight, no endpoint reached -> `failed`
//!   with a deadlock error
//! - abort request -> cooperative cancellation, `aborted` after a bounded
//!   grace period
//! - execution timeout -> `failed` with a timeout error
//!
//! Cycles re-enter through epochs: when a completed node's outputs target a
//! node that already executed (and is below its iteration cap), the whole
//! emission is published under a fresh epoch, so the loop body sees fresh
//! sequences and fresh branch decisions.

use crate::cancel::CancelToken;
use crate::events::ObserverBus;
use crate::handler::{HandlerContext, NodeHandler, Services};
use crate::observers::StateStoreObserver;
use crate::registry::HandlerRegistry;
use dipeo_core::diagram::{Diagram, ErrorAction, Node, NodeType};
use dipeo_core::envelope::{Envelope, PortMap, PORT_DEFAULT};
use dipeo_core::error::{ErrorKind, ExecutionError, FailureDetail};
use dipeo_core::ids::{ExecutionId, NodeId};
use dipeo_core::retry::RetryPolicy;
use dipeo_core::tokens::TokenManager;
use dipeo_state::{ExecutionState, ExecutionStatus, NodeStatus, StateStore};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Engine-wide limits and defaults.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Nodes executed concurrently within a step.
    pub max_parallel_nodes: usize,
    /// Default per-node timeout when the node config has none.
    pub node_timeout: Duration,
    pub execution_timeout: Duration,
    /// How long to wait for in-flight handlers after cancellation.
    pub cancel_grace: Duration,
    /// Default iteration cap per node (loops).
    pub max_iterations: u32,
    /// Default retry policy for transient handler failures.
    pub retry: RetryPolicy,
    /// When false, interactive prompts resolve immediately with "".
    pub interactive: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            node_timeout: Duration::from_secs(60),
            execution_timeout: Duration::from_secs(60 * 60),
            cancel_grace: Duration::from_millis(2_000),
            max_iterations: 100,
            retry: RetryPolicy::default(),
            interactive: true,
        }
    }
}

/// Runtime control surface for one execution: pause/resume, per-node
/// pausing, skip requests and the abort token.
pub struct ExecutionControl {
    cancel: CancelToken,
    paused: AtomicBool,
    paused_nodes: Mutex<HashSet<NodeId>>,
    skip_requested: Mutex<HashSet<NodeId>>,
    resume_notify: Notify,
}

impl ExecutionControl {
    pub fn new() -> Self {
        Self {
            cancel: CancelToken::new(),
            paused: AtomicBool::new(false),
            paused_nodes: Mutex::new(HashSet::new()),
            skip_requested: Mutex::new(HashSet::new()),
            resume_notify: Notify::new(),
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn abort(&self) {
        self.cancel.cancel();
        self.resume_notify.notify_one();
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resume_notify.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Block one node from being dispatched without pausing the execution.
    pub fn pause_node(&self, node_id: NodeId) {
        self.paused_nodes.lock().insert(node_id);
    }

    pub fn resume_node(&self, node_id: &NodeId) {
        self.paused_nodes.lock().remove(node_id);
        self.resume_notify.notify_one();
    }

    pub fn is_node_paused(&self, node_id: &NodeId) -> bool {
        self.paused_nodes.lock().contains(node_id)
    }

    /// Mark a node to be skipped instead of executed at its next dispatch.
    pub fn request_skip(&self, node_id: NodeId) {
        self.skip_requested.lock().insert(node_id);
    }

    fn take_skip(&self, node_id: &NodeId) -> bool {
        self.skip_requested.lock().remove(node_id)
    }
}

impl Default for ExecutionControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Driver-local view of the run; the persisted copy is maintained by the
/// state-store observer.
#[derive(Default)]
struct RunState {
    status: HashMap<NodeId, NodeStatus>,
    exec_count: HashMap<NodeId, u32>,
    completed_endpoints: HashSet<NodeId>,
    any_completed: bool,
}

impl RunState {
    fn status(&self, node_id: &NodeId) -> Option<NodeStatus> {
        self.status.get(node_id).copied()
    }

    fn exec_count(&self, node_id: &NodeId) -> u32 {
        self.exec_count.get(node_id).copied().unwrap_or(0)
    }

    fn is_running(&self, node_id: &NodeId) -> bool {
        self.status(node_id) == Some(NodeStatus::Running)
    }

    fn mark_running(&mut self, node_id: &NodeId) {
        self.status.insert(node_id.clone(), NodeStatus::Running);
        *self.exec_count.entry(node_id.clone()).or_insert(0) += 1;
    }

    fn mark_completed(&mut self, node: &Node) {
        self.status.insert(node.id.clone(), NodeStatus::Completed);
        self.any_completed = true;
        if node.node_type == NodeType::Endpoint {
            self.completed_endpoints.insert(node.id.clone());
        }
    }

    fn mark_failed(&mut self, node_id: &NodeId) {
        self.status.insert(node_id.clone(), NodeStatus::Failed);
    }

    fn mark_skipped(&mut self, node_id: &NodeId) {
        self.status.insert(node_id.clone(), NodeStatus::Skipped);
    }
}

struct NodeOutcome {
    node: Node,
    result: Result<PortMap, ExecutionError>,
    attempts: u32,
}

enum Termination {
    Completed,
    Aborted,
    Failed(FailureDetail),
}

/// Executes one diagram to completion.
pub struct ExecutionEngine {
    diagram: Arc<Diagram>,
    registry: Arc<HandlerRegistry>,
    services: Arc<Services>,
    state_store: Arc<dyn StateStore>,
    observers: Arc<ObserverBus>,
    persistence: Option<Arc<StateStoreObserver>>,
    control: Arc<ExecutionControl>,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(
        diagram: Arc<Diagram>,
        registry: Arc<HandlerRegistry>,
        services: Arc<Services>,
        state_store: Arc<dyn StateStore>,
        observers: Arc<ObserverBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            diagram,
            registry,
            services,
            state_store,
            observers,
            persistence: None,
            control: Arc::new(ExecutionControl::new()),
            config,
        }
    }

    pub fn with_control(mut self, control: Arc<ExecutionControl>) -> Self {
        self.control = control;
        self
    }

    /// Let the engine escalate persistent state-write failures.
    pub fn with_persistence_health(mut self, observer: Arc<StateStoreObserver>) -> Self {
        self.persistence = Some(observer);
        self
    }

    pub fn control(&self) -> Arc<ExecutionControl> {
        self.control.clone()
    }

    /// Run the diagram to a terminal status and return the persisted
    /// execution state.
    pub async fn run(
        &self,
        execution_id: ExecutionId,
        variables: HashMap<String, Value>,
    ) -> Result<ExecutionState, ExecutionError> {
        self.registry.check_requirements(&self.diagram, &self.services)?;

        let tokens = Arc::new(TokenManager::new(self.diagram.clone()));
        let variables = Arc::new(RwLock::new(variables));
        let prompt_waiters = Arc::new(AtomicUsize::new(0));

        self.observers
            .execution_start(&execution_id, self.diagram.id())
            .await;
        if let Err(error) = self
            .state_store
            .update_status(&execution_id, ExecutionStatus::Running, None)
            .await
        {
            warn!(execution = %execution_id, %error, "failed to mark execution running");
        }
        let initial_variables = variables.read().clone();
        if let Err(error) = self
            .state_store
            .update_variables(&execution_id, initial_variables)
            .await
        {
            warn!(execution = %execution_id, %error, "failed to persist initial variables");
        }

        let deadline = tokio::time::Instant::now() + self.config.execution_timeout;
        let cancel = self.control.cancel.clone();
        let mut run = RunState::default();
        let mut join_set: JoinSet<NodeOutcome> = JoinSet::new();

        let outcome = loop {
            if self.persistence.as_ref().is_some_and(|p| p.is_unhealthy()) {
                break Termination::Failed(FailureDetail::from_error(&ExecutionError::State(
                    "state registry unavailable".into(),
                )));
            }
            if cancel.is_cancelled() {
                break Termination::Aborted;
            }
            if tokio::time::Instant::now() >= deadline {
                break Termination::Failed(FailureDetail::from_error(&ExecutionError::timeout(
                    "execution",
                    self.config.execution_timeout.as_millis() as u64,
                )));
            }

            if self.control.is_paused() {
                if join_set.is_empty() {
                    tokio::select! {
                        _ = self.control.resume_notify.notified() => {}
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                } else if let Some(outcome) = self.await_one(&mut join_set, &cancel, deadline).await {
                    if let Some(termination) = self
                        .process_outcome(outcome, &execution_id, &tokens, &mut run)
                        .await
                    {
                        break termination;
                    }
                }
                continue;
            }

            let ready = self.compute_ready(&run, &tokens);
            let mut progressed = false;
            for node in ready {
                let effective_in_flight =
                    join_set.len().saturating_sub(prompt_waiters.load(Ordering::SeqCst));
                if effective_in_flight >= self.config.max_parallel_nodes {
                    break;
                }
                if self.control.take_skip(&node.id) {
                    self.apply_skip(&node, &execution_id, &tokens, &mut run).await;
                    progressed = true;
                    continue;
                }
                self.dispatch(
                    &node,
                    &execution_id,
                    &tokens,
                    &mut run,
                    &variables,
                    &prompt_waiters,
                    &mut join_set,
                )
                .await;
                progressed = true;
            }

            if join_set.is_empty() {
                if progressed {
                    // Only skips happened; recompute readiness.
                    continue;
                }
                break self.final_outcome(&run);
            }

            if let Some(outcome) = self.await_one(&mut join_set, &cancel, deadline).await {
                if let Some(termination) = self
                    .process_outcome(outcome, &execution_id, &tokens, &mut run)
                    .await
                {
                    break termination;
                }
            }
        };

        // Wind down in-flight handlers cooperatively, then forcibly.
        if !join_set.is_empty() {
            cancel.cancel();
            let drained = tokio::time::timeout(self.config.cancel_grace, async {
                while join_set.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(execution = %execution_id, "cancel grace elapsed, aborting node tasks");
                join_set.abort_all();
                while join_set.join_next().await.is_some() {}
            }
        }

        match &outcome {
            Termination::Completed => {
                debug!(execution = %execution_id, "execution completed");
                self.observers.execution_complete(&execution_id).await;
            }
            Termination::Aborted => {
                let detail = FailureDetail::from_error(&ExecutionError::Cancelled(
                    "execution aborted".into(),
                ));
                self.observers.execution_error(&execution_id, &detail).await;
            }
            Termination::Failed(detail) => {
                self.observers.execution_error(&execution_id, detail).await;
            }
        }

        self.state_store
            .get_state(&execution_id)
            .await
            .map_err(|e| ExecutionError::State(e.to_string()))?
            .ok_or_else(|| ExecutionError::State("execution state missing after run".into()))
    }

    /// Ready nodes in stable order: topological index, then node id.
    fn compute_ready(&self, run: &RunState, tokens: &TokenManager) -> Vec<Node> {
        let mut ready: Vec<&Node> = Vec::new();
        for node in self.diagram.nodes() {
            if run.is_running(&node.id) {
                continue;
            }
            if matches!(
                run.status(&node.id),
                Some(NodeStatus::Failed) | Some(NodeStatus::Skipped)
            ) {
                continue;
            }
            if self.control.is_node_paused(&node.id) {
                continue;
            }
            let count = run.exec_count(&node.id);
            let cap = node.config.max_iterations.unwrap_or(self.config.max_iterations);
            if count >= cap {
                continue;
            }
            let is_ready = if node.node_type == NodeType::Start {
                // Start nodes are seeded ready exactly once.
                count == 0
            } else {
                tokens.is_ready(node, count)
            };
            if is_ready {
                ready.push(node);
            }
        }
        ready.sort_by_key(|n| (self.diagram.topo_index(&n.id), n.id.clone()));
        ready.into_iter().cloned().collect()
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        node: &Node,
        execution_id: &ExecutionId,
        tokens: &Arc<TokenManager>,
        run: &mut RunState,
        variables: &Arc<RwLock<HashMap<String, Value>>>,
        prompt_waiters: &Arc<AtomicUsize>,
        join_set: &mut JoinSet<NodeOutcome>,
    ) {
        let exec_count_before = run.exec_count(&node.id);
        run.mark_running(&node.id);
        self.observers.node_start(execution_id, &node.id).await;

        let inputs = tokens.consume_inbound(&node.id, None);
        let epoch = tokens.current_epoch();

        let Some(handler) = self.registry.resolve(node.node_type) else {
            // check_requirements makes this unreachable; fail the node
            // rather than panic if a handler was unregistered mid-run.
            let node = node.clone();
            join_set.spawn(async move {
                let error = ExecutionError::Validation(format!(
                    "no handler registered for node type '{}'",
                    node.node_type.as_str()
                ));
                NodeOutcome {
                    node,
                    result: Err(error),
                    attempts: 1,
                }
            });
            return;
        };

        let node_timeout = node
            .config
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.node_timeout);
        // user_response nodes are governed by the prompt timeout, which
        // resolves with "" instead of failing the node.
        let enforce_timeout = node.node_type != NodeType::UserResponse;

        let ctx = HandlerContext::new(
            execution_id.clone(),
            node.id.clone(),
            epoch,
            exec_count_before,
            self.config.interactive,
            self.diagram.clone(),
            variables.clone(),
            self.services.clone(),
            self.control.cancel.clone(),
            node_timeout,
            prompt_waiters.clone(),
        );

        let retry = node
            .config
            .retry
            .clone()
            .unwrap_or_else(|| self.config.retry.clone());
        let node = node.clone();
        let cancel = self.control.cancel.clone();

        debug!(execution = %execution_id, node = %node.id, epoch, "dispatching node");
        join_set.spawn(async move {
            run_with_retry(
                handler,
                node,
                inputs,
                ctx,
                retry,
                enforce_timeout.then_some(node_timeout),
                cancel,
            )
            .await
        });
    }

    /// Wait for one completion, waking early on abort or deadline.
    async fn await_one(
        &self,
        join_set: &mut JoinSet<NodeOutcome>,
        cancel: &CancelToken,
        deadline: tokio::time::Instant,
    ) -> Option<NodeOutcome> {
        tokio::select! {
            joined = join_set.join_next() => match joined {
                Some(Ok(outcome)) => Some(outcome),
                // Task aborted during wind-down; nothing to process.
                Some(Err(_)) | None => None,
            },
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep_until(deadline) => None,
        }
    }

    /// Apply a completion or failure to the run; `Some` ends the execution.
    async fn process_outcome(
        &self,
        outcome: NodeOutcome,
        execution_id: &ExecutionId,
        tokens: &Arc<TokenManager>,
        run: &mut RunState,
    ) -> Option<Termination> {
        let NodeOutcome {
            node,
            result,
            attempts,
        } = outcome;

        match result {
            Ok(mut outputs) => {
                if attempts > 1 {
                    for envelope in outputs.values_mut() {
                        envelope.meta.retry_count = Some(attempts - 1);
                    }
                }

                if self.is_loop_reentry(&node, &outputs, run) {
                    let epoch = tokens.begin_epoch();
                    debug!(execution = %execution_id, node = %node.id, epoch, "loop re-entry");
                }
                tokens.emit_outputs(&node.id, &outputs, None);
                run.mark_completed(&node);

                let representative = outputs
                    .get(PORT_DEFAULT)
                    .cloned()
                    .or_else(|| outputs.values().next().cloned())
                    .unwrap_or_else(|| Envelope::empty(node.id.clone()));
                self.observers
                    .node_complete(execution_id, &node.id, &representative)
                    .await;
                None
            }
            Err(error) => {
                run.mark_failed(&node.id);
                let cancelled = error.kind() == ErrorKind::Cancelled;
                let mut detail =
                    FailureDetail::from_error(&error).with_retry_count(attempts.saturating_sub(1));
                detail.node_id = Some(node.id.clone());

                if cancelled {
                    // The engine-level abort produces the terminal event.
                    return None;
                }
                self.observers.node_error(execution_id, &node.id, &detail).await;

                match node.config.on_error {
                    ErrorAction::Continue => {
                        warn!(execution = %execution_id, node = %node.id, error = %detail.message,
                              "node failed with on_error=continue, dropping outputs");
                        None
                    }
                    ErrorAction::Abort => Some(Termination::Failed(detail)),
                }
            }
        }
    }

    /// A produced output targeting a node that already executed (and still
    /// has iterations left) wraps the loop around: the emission must land
    /// in a fresh epoch.
    fn is_loop_reentry(&self, node: &Node, outputs: &PortMap, run: &RunState) -> bool {
        for &edge_ref in self.diagram.outgoing_edges(&node.id) {
            let edge = self.diagram.edge(edge_ref);
            let port = if edge.source_output.is_empty() {
                PORT_DEFAULT
            } else {
                edge.source_output.as_str()
            };
            if !outputs.contains_key(port) {
                continue;
            }
            let count = run.exec_count(&edge.target_node_id);
            if count == 0 {
                continue;
            }
            let cap = self
                .diagram
                .node(&edge.target_node_id)
                .and_then(|n| n.config.max_iterations)
                .unwrap_or(self.config.max_iterations);
            if count < cap {
                return true;
            }
        }
        false
    }

    async fn apply_skip(
        &self,
        node: &Node,
        execution_id: &ExecutionId,
        tokens: &Arc<TokenManager>,
        run: &mut RunState,
    ) {
        // Drain inbound tokens so the node does not look ready again.
        let _ = tokens.consume_inbound(&node.id, None);
        run.mark_skipped(&node.id);
        self.observers
            .node_skipped(execution_id, &node.id, Some("skip requested"))
            .await;

        if node.node_type.produces_output() {
            // Downstream joins still need something on the default port.
            let outputs: PortMap = [(PORT_DEFAULT.to_string(), Envelope::empty(node.id.clone()))]
                .into_iter()
                .collect();
            tokens.emit_outputs(&node.id, &outputs, None);
        }
    }

    fn final_outcome(&self, run: &RunState) -> Termination {
        let has_endpoints = self.diagram.endpoint_nodes().next().is_some();
        let satisfied = if has_endpoints {
            !run.completed_endpoints.is_empty()
        } else {
            run.any_completed
        };
        if satisfied {
            Termination::Completed
        } else {
            Termination::Failed(FailureDetail::from_error(&ExecutionError::Deadlock(
                "no runnable nodes and no endpoint reached".into(),
            )))
        }
    }
}

/// Execute one node with timeout enforcement, cooperative cancellation and
/// retry on transient failures.
async fn run_with_retry(
    handler: Arc<dyn NodeHandler>,
    node: Node,
    inputs: PortMap,
    ctx: HandlerContext,
    policy: RetryPolicy,
    timeout: Option<Duration>,
    cancel: CancelToken,
) -> NodeOutcome {
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        let attempt = AssertUnwindSafe(handler.execute(&node, inputs.clone(), &ctx)).catch_unwind();

        let guarded = tokio::select! {
            result = async {
                match timeout {
                    Some(limit) => match tokio::time::timeout(limit, attempt).await {
                        Ok(result) => result,
                        Err(_) => Ok(Err(ExecutionError::timeout(
                            format!("node '{}'", node.id),
                            limit.as_millis() as u64,
                        ))),
                    },
                    None => attempt.await,
                }
            } => result,
            _ = cancel.cancelled() => Ok(Err(ExecutionError::Cancelled("execution aborted".into()))),
        };

        let result = match guarded {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::handler(node.id.clone(), "handler panicked")),
        };

        match result {
            Ok(outputs) => {
                return NodeOutcome {
                    node,
                    result: Ok(outputs),
                    attempts,
                }
            }
            Err(error)
                if error.is_retryable() && policy.should_retry(attempts) && !cancel.is_cancelled() =>
            {
                let delay = policy.calculate_delay(attempts);
                debug!(node = %node.id, attempt = attempts, ?delay, "retrying after transient failure");
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                return NodeOutcome {
                    node,
                    result: Err(error),
                    attempts,
                }
            }
        }
    }
}
