//! End-to-end engine scenarios: full executions through the service
//! facade with stubbed collaborator ports and scripted handlers.

use async_trait::async_trait;
use dipeo_conversation::{ConversationStore, MessageRole};
use dipeo_core::diagram::{DiagramBuilder, ErrorAction, JoinPolicy, Node, NodeType, PersonSpec};
use dipeo_core::envelope::{
    ContentType, Envelope, PortMap, PORT_CONDFALSE, PORT_CONDTRUE, PORT_DEFAULT,
};
use dipeo_core::error::{ErrorKind, ExecutionError};
use dipeo_core::ids::{ApiKeyId, DiagramId, ExecutionId, NodeId};
use dipeo_core::retry::RetryPolicy;
use dipeo_core::usage::TokenUsage;
use dipeo_engine::engine::{EngineConfig, ExecutionControl, ExecutionEngine};
use dipeo_engine::events::{EventType, ExecutionEvent, ObserverBus};
use dipeo_engine::handler::{HandlerContext, NodeHandler, Services};
use dipeo_engine::observers::{StateStoreObserver, Subscription};
use dipeo_engine::prompts::PromptBus;
use dipeo_engine::registry::HandlerRegistry;
use dipeo_engine::service::{ControlAction, ExecuteOptions, ExecutionService};
use dipeo_engine::{LlmClient, LlmRequest, LlmResponse, StubLlm};
use dipeo_state::{ExecutionStatus, InMemoryStateStore, NodeStatus, StateStore};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// code_job stand-in that records its inputs and emits "ok".
struct CaptureHandler {
    seen: Arc<Mutex<HashMap<NodeId, Vec<PortMap>>>>,
}

impl CaptureHandler {
    fn new() -> (Self, Arc<Mutex<HashMap<NodeId, Vec<PortMap>>>>) {
        let seen = Arc::new(Mutex::new(HashMap::new()));
        (Self { seen: seen.clone() }, seen)
    }
}

#[async_trait]
impl NodeHandler for CaptureHandler {
    fn node_type(&self) -> NodeType {
        NodeType::CodeJob
    }

    async fn execute(
        &self,
        node: &Node,
        inputs: PortMap,
        _ctx: &HandlerContext,
    ) -> Result<PortMap, ExecutionError> {
        self.seen.lock().entry(node.id.clone()).or_default().push(inputs);
        Ok([(PORT_DEFAULT.to_string(), Envelope::text(node.id.clone(), "ok"))]
            .into_iter()
            .collect())
    }
}

/// Condition handler that takes a scripted sequence of decisions.
struct ScriptedCondition {
    script: Mutex<VecDeque<bool>>,
}

impl ScriptedCondition {
    fn new(decisions: &[bool]) -> Self {
        Self {
            script: Mutex::new(decisions.iter().copied().collect()),
        }
    }
}

#[async_trait]
impl NodeHandler for ScriptedCondition {
    fn node_type(&self) -> NodeType {
        NodeType::Condition
    }

    async fn execute(
        &self,
        node: &Node,
        _inputs: PortMap,
        _ctx: &HandlerContext,
    ) -> Result<PortMap, ExecutionError> {
        let flag = self.script.lock().pop_front().unwrap_or(false);
        let port = if flag { PORT_CONDTRUE } else { PORT_CONDFALSE };
        Ok([(
            port.to_string(),
            Envelope::json(node.id.clone(), json!({ "result": flag })),
        )]
        .into_iter()
        .collect())
    }
}

/// code_job stand-in failing transiently a fixed number of times.
struct FlakyHandler {
    remaining_failures: AtomicU32,
}

impl FlakyHandler {
    fn new(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl NodeHandler for FlakyHandler {
    fn node_type(&self) -> NodeType {
        NodeType::CodeJob
    }

    async fn execute(
        &self,
        node: &Node,
        _inputs: PortMap,
        _ctx: &HandlerContext,
    ) -> Result<PortMap, ExecutionError> {
        let before = self.remaining_failures.load(Ordering::SeqCst);
        if before > 0 {
            self.remaining_failures.store(before - 1, Ordering::SeqCst);
            return Err(ExecutionError::Transient("simulated 503".into()));
        }
        Ok([(PORT_DEFAULT.to_string(), Envelope::text(node.id.clone(), "recovered"))]
            .into_iter()
            .collect())
    }
}

/// code_job stand-in that always fails deterministically.
struct FailingHandler;

#[async_trait]
impl NodeHandler for FailingHandler {
    fn node_type(&self) -> NodeType {
        NodeType::CodeJob
    }

    async fn execute(
        &self,
        node: &Node,
        _inputs: PortMap,
        _ctx: &HandlerContext,
    ) -> Result<PortMap, ExecutionError> {
        Err(ExecutionError::handler(node.id.clone(), "always fails"))
    }
}

/// LLM double that records every request and answers per model.
struct RecordingLlm {
    requests: Arc<Mutex<Vec<LlmRequest>>>,
}

#[async_trait]
impl LlmClient for RecordingLlm {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, ExecutionError> {
        self.requests.lock().push(request.clone());
        let text = match request.model.as_str() {
            "model-a" => "reply from p1",
            _ => "reply from p2",
        };
        Ok(LlmResponse {
            text: text.into(),
            usage: TokenUsage::new(1, 1),
            raw: None,
        })
    }
}

/// code_job stand-in that sleeps (abort and pause scenarios).
struct SleeperHandler {
    duration: Duration,
}

#[async_trait]
impl NodeHandler for SleeperHandler {
    fn node_type(&self) -> NodeType {
        NodeType::CodeJob
    }

    async fn execute(
        &self,
        node: &Node,
        _inputs: PortMap,
        _ctx: &HandlerContext,
    ) -> Result<PortMap, ExecutionError> {
        tokio::time::sleep(self.duration).await;
        Ok([(PORT_DEFAULT.to_string(), Envelope::text(node.id.clone(), "woke up"))]
            .into_iter()
            .collect())
    }
}

fn registry_with(handlers: Vec<Arc<dyn NodeHandler>>) -> Arc<HandlerRegistry> {
    let registry = HandlerRegistry::builtin();
    for handler in handlers {
        registry.register(handler);
    }
    Arc::new(registry)
}

async fn drain(mut subscription: Subscription) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(20), subscription.recv()).await {
            Ok(Some(event)) => events.push(event),
            Ok(None) => break,
            Err(_) => panic!("event stream stalled; got {:?}", types(&events)),
        }
    }
    events
}

fn types(events: &[ExecutionEvent]) -> Vec<EventType> {
    events.iter().map(|e| e.event_type).collect()
}

fn position(events: &[ExecutionEvent], event_type: EventType, node: Option<&str>) -> Option<usize> {
    events.iter().position(|e| {
        e.event_type == event_type
            && node.map_or(true, |n| e.node_id.as_ref().map(|id| id.as_str()) == Some(n))
    })
}

fn assert_ordered(events: &[ExecutionEvent], sequence: &[(EventType, Option<&str>)]) {
    let mut last = 0;
    for (event_type, node) in sequence {
        let found = events[last..]
            .iter()
            .position(|e| {
                e.event_type == *event_type
                    && node.map_or(true, |n| e.node_id.as_ref().map(|id| id.as_str()) == Some(n))
            })
            .unwrap_or_else(|| {
                panic!(
                    "missing {:?} for {:?} after index {}; events: {:?}",
                    event_type,
                    node,
                    last,
                    types(events)
                )
            });
        last += found + 1;
    }
}

async fn final_state(service: &Arc<ExecutionService>, id: &ExecutionId) -> dipeo_state::ExecutionState {
    service.state_store().get_state(id).await.unwrap().unwrap()
}

// S1 - linear start -> person_job -> endpoint flow.
#[tokio::test]
async fn test_linear_three_node_flow() {
    let diagram = Arc::new(
        DiagramBuilder::new()
            .node(Node::new("s", NodeType::Start))
            .node(
                Node::new("p", NodeType::PersonJob)
                    .with_max_iterations(1)
                    .with_extra(json!({ "person": "p1", "prompt": "echo {x}" })),
            )
            .node(Node::new("e", NodeType::Endpoint))
            .edge("s", "default", "p", "default")
            .edge("p", "default", "e", "default")
            .person(
                "p1",
                PersonSpec {
                    service: "openai".into(),
                    model: "gpt-4o".into(),
                    api_key_id: ApiKeyId::new("key_1"),
                    system_prompt: None,
                    label: None,
                },
            )
            .build()
            .unwrap(),
    );

    let service = ExecutionService::builder()
        .with_llm(Arc::new(StubLlm::new("echo hello", TokenUsage::new(3, 2))))
        .build();

    let options = ExecuteOptions::default().with_variable("x", json!("hello"));
    let (id, subscription) = service.execute_with_subscription(diagram, options).unwrap();
    let events = drain(subscription).await;

    assert_ordered(
        &events,
        &[
            (EventType::ExecutionStart, None),
            (EventType::NodeStart, Some("s")),
            (EventType::NodeComplete, Some("s")),
            (EventType::NodeStart, Some("p")),
            (EventType::NodeComplete, Some("p")),
            (EventType::NodeStart, Some("e")),
            (EventType::NodeComplete, Some("e")),
            (EventType::ExecutionComplete, None),
        ],
    );

    let state = final_state(&service, &id).await;
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert!(!state.is_active);
    assert_eq!(
        state.node_outputs[&NodeId::new("p")].body.as_text(),
        Some("echo hello")
    );
    assert_eq!(state.token_usage, TokenUsage::new(3, 2));
    assert_eq!(state.token_usage.total, 5);
}

// S2 - condition branch: only the taken branch runs.
#[tokio::test]
async fn test_condition_branch_filtering() {
    let diagram = Arc::new(
        DiagramBuilder::new()
            .node(Node::new("s", NodeType::Start))
            .node(Node::new("c", NodeType::Condition))
            .node(Node::new("a", NodeType::CodeJob))
            .node(Node::new("b", NodeType::CodeJob))
            .node(Node::new("e", NodeType::Endpoint))
            .edge("s", "default", "c", "default")
            .edge("c", "condtrue", "a", "default")
            .edge("c", "condfalse", "b", "default")
            .edge("a", "default", "e", "default")
            .edge("b", "default", "e", "default")
            .build()
            .unwrap(),
    );

    let (capture, _seen) = CaptureHandler::new();
    let registry = registry_with(vec![
        Arc::new(capture),
        Arc::new(ScriptedCondition::new(&[true])),
    ]);
    let service = ExecutionService::builder().with_registry(registry).build();

    let (id, subscription) = service
        .execute_with_subscription(diagram, ExecuteOptions::default())
        .unwrap();
    let events = drain(subscription).await;

    assert!(position(&events, EventType::NodeStart, Some("a")).is_some());
    assert!(position(&events, EventType::NodeStart, Some("b")).is_none());

    let state = final_state(&service, &id).await;
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.node_states[&NodeId::new("a")].status, NodeStatus::Completed);
    assert!(!state.node_states.contains_key(&NodeId::new("b")));
    // The endpoint consumed exactly one inbound token.
    assert_eq!(state.node_states[&NodeId::new("e")].exec_count, 1);
}

// S3 - join policy `all` with a skippable condition source.
#[tokio::test]
async fn test_all_join_with_skippable_condition() {
    let diagram = Arc::new(
        DiagramBuilder::new()
            .node(Node::new("s", NodeType::Start))
            .node(Node::new("c", NodeType::Condition).skippable())
            .node(Node::new("a", NodeType::CodeJob).with_join(JoinPolicy::All))
            .edge("s", "default", "a", "default")
            .edge("s", "default", "c", "default")
            .edge("c", "condtrue", "a", "cond")
            .build()
            .unwrap(),
    );

    let (capture, seen) = CaptureHandler::new();
    let registry = registry_with(vec![
        Arc::new(capture),
        Arc::new(ScriptedCondition::new(&[false])),
    ]);
    let service = ExecutionService::builder().with_registry(registry).build();

    let (id, subscription) = service
        .execute_with_subscription(diagram, ExecuteOptions::default())
        .unwrap();
    let events = drain(subscription).await;

    assert!(position(&events, EventType::ExecutionComplete, None).is_some());
    let state = final_state(&service, &id).await;
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.node_states[&NodeId::new("a")].status, NodeStatus::Completed);

    // `a` ran on the start token alone; nothing arrived from `c`.
    let seen = seen.lock();
    let runs = &seen[&NodeId::new("a")];
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].len(), 1);
    assert!(runs[0].contains_key("default"));
}

// S4 - loop with epoch increments and an iteration cap.
#[tokio::test]
async fn test_loop_with_epoch_increment() {
    let diagram = Arc::new(
        DiagramBuilder::new()
            .node(Node::new("s", NodeType::Start))
            .node(
                Node::new("p", NodeType::PersonJob)
                    .with_max_iterations(3)
                    .with_extra(json!({ "person": "p1", "prompt": "iterate" })),
            )
            .node(Node::new("c", NodeType::Condition))
            .node(Node::new("e", NodeType::Endpoint))
            .edge("s", "default", "p", "default")
            .edge("p", "default", "c", "default")
            .edge("c", "condtrue", "p", "default")
            .edge("c", "condfalse", "e", "default")
            .person(
                "p1",
                PersonSpec {
                    service: "openai".into(),
                    model: "gpt-4o".into(),
                    api_key_id: ApiKeyId::new("key_1"),
                    system_prompt: None,
                    label: None,
                },
            )
            .build()
            .unwrap(),
    );

    let registry = registry_with(vec![Arc::new(ScriptedCondition::new(&[true, true, false]))]);
    let service = ExecutionService::builder()
        .with_registry(registry)
        .with_llm(Arc::new(StubLlm::new("next", TokenUsage::new(1, 1))))
        .build();

    let (id, subscription) = service
        .execute_with_subscription(diagram, ExecuteOptions::default())
        .unwrap();
    let events = drain(subscription).await;

    let p_starts = events
        .iter()
        .filter(|e| {
            e.event_type == EventType::NodeStart
                && e.node_id.as_ref().map(|n| n.as_str()) == Some("p")
        })
        .count();
    assert_eq!(p_starts, 3);

    let state = final_state(&service, &id).await;
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.node_states[&NodeId::new("p")].exec_count, 3);
    assert_eq!(state.node_states[&NodeId::new("c")].exec_count, 3);
    assert_eq!(state.node_states[&NodeId::new("e")].status, NodeStatus::Completed);
}

// S5 - retry on transient failure, no spurious node_error.
#[tokio::test]
async fn test_retry_on_transient_failure() {
    let diagram = Arc::new(
        DiagramBuilder::new()
            .node(Node::new("s", NodeType::Start))
            .node(
                Node::new("h", NodeType::CodeJob)
                    .with_retry(RetryPolicy::new(3, 10, 1_000).with_jitter(false)),
            )
            .node(Node::new("e", NodeType::Endpoint))
            .edge("s", "default", "h", "default")
            .edge("h", "default", "e", "default")
            .build()
            .unwrap(),
    );

    let registry = registry_with(vec![Arc::new(FlakyHandler::new(2))]);
    let service = ExecutionService::builder().with_registry(registry).build();

    let started = Instant::now();
    let (id, subscription) = service
        .execute_with_subscription(diagram, ExecuteOptions::default())
        .unwrap();
    let events = drain(subscription).await;
    let elapsed = started.elapsed();

    let h_completes = events
        .iter()
        .filter(|e| {
            e.event_type == EventType::NodeComplete
                && e.node_id.as_ref().map(|n| n.as_str()) == Some("h")
        })
        .count();
    assert_eq!(h_completes, 1);
    assert!(position(&events, EventType::NodeError, Some("h")).is_none());

    // Two backoffs: 10ms then 20ms.
    assert!(elapsed >= Duration::from_millis(30), "elapsed {:?}", elapsed);

    let state = final_state(&service, &id).await;
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(
        state.node_outputs[&NodeId::new("h")].meta.retry_count,
        Some(2)
    );
}

// S7 - on_every_turn consolidation across two alternating persons
// exchanging memory over conversation_state edges.
#[tokio::test]
async fn test_on_every_turn_consolidation() {
    let diagram = Arc::new(
        DiagramBuilder::new()
            .node(Node::new("s", NodeType::Start))
            .node(
                Node::new("p1", NodeType::PersonJob)
                    .with_max_iterations(2)
                    .with_extra(json!({
                        "person": "pa",
                        "prompt": "make your case",
                        "forget_mode": "on_every_turn",
                    })),
            )
            .node(
                Node::new("p2", NodeType::PersonJob)
                    .with_max_iterations(2)
                    .with_extra(json!({ "person": "pb", "prompt": "rebut" })),
            )
            .edge("s", "default", "p1", "default")
            .typed_edge(
                "p1",
                "conversation",
                "p2",
                "conversation",
                ContentType::ConversationState,
            )
            .typed_edge(
                "p2",
                "conversation",
                "p1",
                "conversation",
                ContentType::ConversationState,
            )
            .person(
                "pa",
                PersonSpec {
                    service: "openai".into(),
                    model: "model-a".into(),
                    api_key_id: ApiKeyId::new("key_a"),
                    system_prompt: Some("you are P1".into()),
                    label: Some("P1".into()),
                },
            )
            .person(
                "pb",
                PersonSpec {
                    service: "openai".into(),
                    model: "model-b".into(),
                    api_key_id: ApiKeyId::new("key_b"),
                    system_prompt: None,
                    label: Some("P2".into()),
                },
            )
            .build()
            .unwrap(),
    );

    let requests = Arc::new(Mutex::new(Vec::new()));
    let service = ExecutionService::builder()
        .with_llm(Arc::new(RecordingLlm {
            requests: requests.clone(),
        }))
        .build();

    let (id, subscription) = service
        .execute_with_subscription(diagram, ExecuteOptions::default())
        .unwrap();
    let events = drain(subscription).await;
    assert!(position(&events, EventType::ExecutionComplete, None).is_some());

    let state = final_state(&service, &id).await;
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.node_states[&NodeId::new("p1")].exec_count, 2);
    assert_eq!(state.node_states[&NodeId::new("p2")].exec_count, 2);

    let requests = requests.lock();
    let p1_requests: Vec<&LlmRequest> =
        requests.iter().filter(|r| r.model == "model-a").collect();
    assert_eq!(p1_requests.len(), 2);

    // P1's second turn sees its system prompt, one consolidated block
    // holding P2's latest reply, and only the most recent user prompt.
    let second = p1_requests[1];
    let contents: Vec<&str> = second.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(second.messages[0].role, MessageRole::System);
    assert_eq!(second.messages[0].content, "you are P1");
    assert!(
        contents.contains(&"[P2]: reply from p2"),
        "messages: {:?}",
        contents
    );
    assert_eq!(second.messages.last().unwrap().content, "make your case");
    let user_count = second
        .messages
        .iter()
        .filter(|m| m.role == MessageRole::User)
        .count();
    // The consolidated block plus the latest prompt, nothing older.
    assert_eq!(user_count, 2);

    // P2's first turn received the upstream exchange as plain context.
    let p2_first = requests.iter().find(|r| r.model == "model-b").unwrap();
    assert!(p2_first
        .messages
        .iter()
        .any(|m| m.role == MessageRole::User
            && m.content.contains("Response: reply from p1")));
}

// S6 - interactive prompt timeout resolves with an empty string.
#[tokio::test]
async fn test_interactive_prompt_timeout() {
    let diagram = Arc::new(
        DiagramBuilder::new()
            .node(Node::new("s", NodeType::Start))
            .node(
                Node::new("u", NodeType::UserResponse)
                    .with_timeout_ms(200)
                    .with_extra(json!({ "prompt": "your name?" })),
            )
            .node(Node::new("e", NodeType::Endpoint))
            .edge("s", "default", "u", "default")
            .edge("u", "default", "e", "default")
            .build()
            .unwrap(),
    );

    let service = ExecutionService::builder().build();
    let (id, subscription) = service
        .execute_with_subscription(diagram, ExecuteOptions::interactive())
        .unwrap();
    let events = drain(subscription).await;

    assert_ordered(
        &events,
        &[
            (EventType::NodeStart, Some("u")),
            (EventType::InteractivePrompt, Some("u")),
            (EventType::InteractivePromptTimeout, Some("u")),
            (EventType::NodeComplete, Some("u")),
            (EventType::ExecutionComplete, None),
        ],
    );

    let state = final_state(&service, &id).await;
    assert_eq!(state.status, ExecutionStatus::Completed);
    // The empty response flowed to the endpoint on `default`.
    assert_eq!(state.node_outputs[&NodeId::new("e")].body.as_text(), Some(""));
}

// Responding to a prompt resolves the node with the given text.
#[tokio::test]
async fn test_interactive_prompt_response() {
    let diagram = Arc::new(
        DiagramBuilder::new()
            .node(Node::new("s", NodeType::Start))
            .node(
                Node::new("u", NodeType::UserResponse)
                    .with_timeout_ms(10_000)
                    .with_extra(json!({ "prompt": "your name?" })),
            )
            .node(Node::new("e", NodeType::Endpoint))
            .edge("s", "default", "u", "default")
            .edge("u", "default", "e", "default")
            .build()
            .unwrap(),
    );

    let service = ExecutionService::builder().build();
    let (id, mut subscription) = service
        .execute_with_subscription(diagram, ExecuteOptions::interactive())
        .unwrap();

    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(20), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        let prompt_seen = event.event_type == EventType::InteractivePrompt;
        events.push(event);
        if prompt_seen {
            assert!(service.respond(&id, &NodeId::new("u"), "Ada".into()));
        }
        if events.last().map(|e| e.event_type.is_terminal()).unwrap_or(false) {
            break;
        }
    }

    assert!(position(&events, EventType::InteractivePromptTimeout, None).is_none());
    let state = final_state(&service, &id).await;
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(
        state.node_outputs[&NodeId::new("e")].body.as_text(),
        Some("Ada")
    );
}

// Unsatisfiable join: no endpoint reached, execution fails with deadlock.
#[tokio::test]
async fn test_deadlock_detection() {
    let diagram = Arc::new(
        DiagramBuilder::new()
            .node(Node::new("s", NodeType::Start))
            .node(Node::new("orphan", NodeType::CodeJob))
            .node(Node::new("a", NodeType::CodeJob).with_join(JoinPolicy::All))
            .node(Node::new("e", NodeType::Endpoint))
            .edge("s", "default", "a", "left")
            .edge("orphan", "default", "a", "right")
            .edge("a", "default", "e", "default")
            .build()
            .unwrap(),
    );

    let (capture, _) = CaptureHandler::new();
    let registry = registry_with(vec![Arc::new(capture)]);
    let service = ExecutionService::builder().with_registry(registry).build();

    let (id, subscription) = service
        .execute_with_subscription(diagram, ExecuteOptions::default())
        .unwrap();
    let events = drain(subscription).await;

    let error_index = position(&events, EventType::ExecutionError, None).unwrap();
    assert_eq!(events[error_index].data["error"]["kind"], "deadlock");

    let state = final_state(&service, &id).await;
    assert_eq!(state.status, ExecutionStatus::Failed);
    assert!(state.error.as_deref().unwrap_or_default().contains("deadlock"));
}

// on_error=continue drops outputs and lets the rest of the diagram finish.
#[tokio::test]
async fn test_on_error_continue() {
    let diagram = Arc::new(
        DiagramBuilder::new()
            .node(Node::new("s", NodeType::Start))
            .node(Node::new("f", NodeType::CodeJob).with_on_error(ErrorAction::Continue))
            .node(Node::new("g", NodeType::UserResponse).with_timeout_ms(1))
            .node(Node::new("e", NodeType::Endpoint))
            .edge("s", "default", "f", "default")
            .edge("s", "default", "g", "default")
            .edge("f", "default", "e", "default")
            .edge("g", "default", "e", "default")
            .build()
            .unwrap(),
    );

    let registry = registry_with(vec![Arc::new(FailingHandler)]);
    let service = ExecutionService::builder().with_registry(registry).build();

    let (id, subscription) = service
        .execute_with_subscription(diagram, ExecuteOptions::default())
        .unwrap();
    let events = drain(subscription).await;

    assert!(position(&events, EventType::NodeError, Some("f")).is_some());
    assert!(position(&events, EventType::ExecutionComplete, None).is_some());

    let state = final_state(&service, &id).await;
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.node_states[&NodeId::new("f")].status, NodeStatus::Failed);
    assert_eq!(state.node_states[&NodeId::new("e")].status, NodeStatus::Completed);
}

// Abort cancels in-flight handlers and ends the execution as aborted.
#[tokio::test]
async fn test_abort_cancels_in_flight_nodes() {
    let diagram = Arc::new(
        DiagramBuilder::new()
            .node(Node::new("s", NodeType::Start))
            .node(Node::new("slow", NodeType::CodeJob))
            .node(Node::new("e", NodeType::Endpoint))
            .edge("s", "default", "slow", "default")
            .edge("slow", "default", "e", "default")
            .build()
            .unwrap(),
    );

    let registry = registry_with(vec![Arc::new(SleeperHandler {
        duration: Duration::from_secs(60),
    })]);
    let service = ExecutionService::builder().with_registry(registry).build();

    let (id, subscription) = service
        .execute_with_subscription(diagram, ExecuteOptions::default())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    service.control(&id, ControlAction::Abort).unwrap();

    let started = Instant::now();
    let events = drain(subscription).await;
    assert!(started.elapsed() < Duration::from_secs(10));

    let error_index = position(&events, EventType::ExecutionError, None).unwrap();
    assert_eq!(events[error_index].data["error"]["kind"], "cancelled");

    let state = final_state(&service, &id).await;
    assert_eq!(state.status, ExecutionStatus::Aborted);
    assert!(!state.is_active);
}

// A skip request resolves the node with a synthetic empty envelope.
#[tokio::test]
async fn test_skip_requested_node() {
    let diagram = Arc::new(
        DiagramBuilder::new()
            .node(Node::new("s", NodeType::Start))
            .node(Node::new("m", NodeType::CodeJob))
            .node(Node::new("e", NodeType::Endpoint))
            .edge("s", "default", "m", "default")
            .edge("m", "default", "e", "default")
            .build()
            .unwrap(),
    );

    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let persistence = Arc::new(StateStoreObserver::new(store.clone()));
    let observers = Arc::new(ObserverBus::new(vec![persistence.clone()]));
    let services = Arc::new(Services::new(
        Arc::new(ConversationStore::new()),
        Arc::new(PromptBus::new()),
        observers.clone(),
    ));
    let (capture, _) = CaptureHandler::new();
    let registry = registry_with(vec![Arc::new(capture)]);

    let control = Arc::new(ExecutionControl::new());
    control.request_skip(NodeId::new("m"));

    let engine = ExecutionEngine::new(
        diagram,
        registry,
        services,
        store.clone(),
        observers,
        EngineConfig::default(),
    )
    .with_control(control)
    .with_persistence_health(persistence);

    let state = engine
        .run(ExecutionId::new("exec_skip"), HashMap::new())
        .await
        .unwrap();

    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.node_states[&NodeId::new("m")].status, NodeStatus::Skipped);
    assert_eq!(state.node_states[&NodeId::new("m")].exec_count, 0);
    // The endpoint still ran, fed by the synthetic empty envelope.
    assert_eq!(state.node_states[&NodeId::new("e")].status, NodeStatus::Completed);
    assert!(state.node_outputs[&NodeId::new("e")].body.is_empty());
}

// Pausing before any dispatch holds the whole execution.
#[tokio::test]
async fn test_pause_and_resume() {
    let diagram = Arc::new(
        DiagramBuilder::new()
            .node(Node::new("s", NodeType::Start))
            .node(Node::new("e", NodeType::Endpoint))
            .edge("s", "default", "e", "default")
            .build()
            .unwrap(),
    );

    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let persistence = Arc::new(StateStoreObserver::new(store.clone()));
    let observers = Arc::new(ObserverBus::new(vec![persistence.clone()]));
    let services = Arc::new(Services::new(
        Arc::new(ConversationStore::new()),
        Arc::new(PromptBus::new()),
        observers.clone(),
    ));

    let control = Arc::new(ExecutionControl::new());
    control.pause();

    let engine = ExecutionEngine::new(
        diagram,
        Arc::new(HandlerRegistry::builtin()),
        services,
        store.clone(),
        observers,
        EngineConfig::default(),
    )
    .with_control(control.clone())
    .with_persistence_health(persistence);

    let run = tokio::spawn(async move {
        engine.run(ExecutionId::new("exec_pause"), HashMap::new()).await
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    let paused_state = store
        .get_state(&ExecutionId::new("exec_pause"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(paused_state.status, ExecutionStatus::Running);
    assert!(paused_state.node_states.is_empty());

    control.resume();
    let state = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
}

// A sub_diagram node runs a registered child diagram to completion.
#[tokio::test]
async fn test_sub_diagram_execution() {
    let child = Arc::new(
        DiagramBuilder::new()
            .diagram_id("child")
            .node(Node::new("cs", NodeType::Start))
            .node(Node::new("ce", NodeType::Endpoint))
            .edge("cs", "default", "ce", "default")
            .build()
            .unwrap(),
    );
    let parent = Arc::new(
        DiagramBuilder::new()
            .node(Node::new("s", NodeType::Start))
            .node(
                Node::new("sub", NodeType::SubDiagram).with_extra(json!({
                    "diagram_id": "child",
                    "variables": { "inner": "yes" },
                })),
            )
            .node(Node::new("e", NodeType::Endpoint))
            .edge("s", "default", "sub", "default")
            .edge("sub", "default", "e", "default")
            .build()
            .unwrap(),
    );

    let service = ExecutionService::builder().build();
    service.register_diagram(DiagramId::new("child"), child);

    let (id, subscription) = service
        .execute_with_subscription(parent, ExecuteOptions::default())
        .unwrap();
    let events = drain(subscription).await;
    assert!(position(&events, EventType::ExecutionComplete, None).is_some());

    let state = final_state(&service, &id).await;
    assert_eq!(state.status, ExecutionStatus::Completed);

    // The child's endpoint output (the child start variables) surfaced as
    // the sub node's output, stamped as produced by the sub node.
    let sub_output = &state.node_outputs[&NodeId::new("sub")];
    assert_eq!(sub_output.produced_by, NodeId::new("sub"));
    let body = sub_output.body.as_json().unwrap();
    assert_eq!(body["inner"], "yes");
}

// Missing collaborator ports are rejected before anything starts.
#[tokio::test]
async fn test_missing_service_rejected_up_front() {
    let diagram = Arc::new(
        DiagramBuilder::new()
            .node(Node::new("p", NodeType::PersonJob))
            .build()
            .unwrap(),
    );
    let service = ExecutionService::builder().build();
    let err = service.execute(diagram, ExecuteOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}
