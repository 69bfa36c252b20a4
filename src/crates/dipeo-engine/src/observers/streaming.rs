//! Observer that streams lifecycle events to live subscribers.
//!
//! Each subscriber owns its own queue, so every subscriber sees events in
//! publish order. Control events are never dropped; high-rate
//! `node_progress` events are bounded per queue and drop-oldest under
//! pressure (with a warning). A subscription ends after it delivers the
//! execution's terminal event.

use crate::events::{EventType, ExecutionEvent, ExecutionObserver};
use async_trait::async_trait;
use dashmap::DashMap;
use dipeo_core::envelope::Envelope;
use dipeo_core::error::FailureDetail;
use dipeo_core::ids::{DiagramId, ExecutionId, NodeId};
use futures::Stream;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::warn;

/// Default cap on buffered `node_progress` events per subscriber.
pub const DEFAULT_PROGRESS_BOUND: usize = 256;

struct EventQueue {
    events: Mutex<VecDeque<ExecutionEvent>>,
    notify: Notify,
    closed: AtomicBool,
}

impl EventQueue {
    fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, event: ExecutionEvent, progress_bound: usize) {
        {
            let mut events = self.events.lock();
            if event.event_type.is_progress() {
                let buffered = events.iter().filter(|e| e.event_type.is_progress()).count();
                if buffered >= progress_bound {
                    let oldest = events.iter().position(|e| e.event_type.is_progress());
                    if let Some(dropped) = oldest.and_then(|i| events.remove(i)) {
                        warn!(
                            execution = %dropped.execution_id,
                            "progress queue full, dropping oldest progress event"
                        );
                    }
                }
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// A live event feed for one execution.
pub struct Subscription {
    queue: Arc<EventQueue>,
    finished: bool,
}

impl Subscription {
    /// Next event in publish order; `None` once the execution's terminal
    /// event has been delivered (or the feed was closed empty).
    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        if self.finished {
            return None;
        }
        loop {
            if let Some(event) = self.queue.events.lock().pop_front() {
                if event.event_type.is_terminal() {
                    self.finished = true;
                }
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                self.finished = true;
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Adapt the subscription into a [`Stream`] of events.
    pub fn into_stream(mut self) -> impl Stream<Item = ExecutionEvent> {
        async_stream::stream! {
            while let Some(event) = self.recv().await {
                yield event;
            }
        }
    }
}

/// Fans lifecycle events out to per-execution subscriber queues.
pub struct StreamingObserver {
    subscribers: DashMap<ExecutionId, Vec<Arc<EventQueue>>>,
    progress_bound: usize,
}

impl StreamingObserver {
    pub fn new() -> Self {
        Self::with_progress_bound(DEFAULT_PROGRESS_BOUND)
    }

    pub fn with_progress_bound(progress_bound: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            progress_bound,
        }
    }

    /// Open a new subscription for an execution. Subscribing before the
    /// execution starts guarantees a complete event sequence.
    pub fn subscribe(&self, execution_id: &ExecutionId) -> Subscription {
        let queue = Arc::new(EventQueue::new());
        self.subscribers
            .entry(execution_id.clone())
            .or_default()
            .push(queue.clone());
        Subscription {
            queue,
            finished: false,
        }
    }

    fn publish(&self, event: ExecutionEvent) {
        let terminal = event.event_type.is_terminal();
        if let Some(queues) = self.subscribers.get(&event.execution_id) {
            for queue in queues.iter() {
                queue.push(event.clone(), self.progress_bound);
                if terminal {
                    queue.close();
                }
            }
        }
        if terminal {
            self.subscribers.remove(&event.execution_id);
        }
    }

    fn emit(
        &self,
        event_type: EventType,
        execution_id: &ExecutionId,
        node_id: Option<&NodeId>,
        data: Value,
    ) {
        self.publish(ExecutionEvent::new(
            event_type,
            execution_id.clone(),
            node_id.cloned(),
            data,
        ));
    }
}

impl Default for StreamingObserver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionObserver for StreamingObserver {
    async fn on_execution_start(&self, execution_id: &ExecutionId, diagram_id: Option<&DiagramId>) {
        self.emit(
            EventType::ExecutionStart,
            execution_id,
            None,
            json!({ "diagram_id": diagram_id }),
        );
    }

    async fn on_execution_complete(&self, execution_id: &ExecutionId) {
        self.emit(
            EventType::ExecutionComplete,
            execution_id,
            None,
            json!({ "status": "completed" }),
        );
    }

    async fn on_execution_error(&self, execution_id: &ExecutionId, error: &FailureDetail) {
        self.emit(
            EventType::ExecutionError,
            execution_id,
            None,
            json!({ "error": error }),
        );
    }

    async fn on_node_start(&self, execution_id: &ExecutionId, node_id: &NodeId) {
        self.emit(
            EventType::NodeStart,
            execution_id,
            Some(node_id),
            json!({ "status": "running" }),
        );
    }

    async fn on_node_progress(&self, execution_id: &ExecutionId, node_id: &NodeId, message: &str) {
        self.emit(
            EventType::NodeProgress,
            execution_id,
            Some(node_id),
            json!({ "message": message }),
        );
    }

    async fn on_node_complete(&self, execution_id: &ExecutionId, node_id: &NodeId, output: &Envelope) {
        self.emit(
            EventType::NodeComplete,
            execution_id,
            Some(node_id),
            json!({ "status": "completed", "output": output.body.to_value() }),
        );
    }

    async fn on_node_error(&self, execution_id: &ExecutionId, node_id: &NodeId, error: &FailureDetail) {
        self.emit(
            EventType::NodeError,
            execution_id,
            Some(node_id),
            json!({ "status": "failed", "error": error }),
        );
    }

    async fn on_node_skipped(&self, execution_id: &ExecutionId, node_id: &NodeId, reason: Option<&str>) {
        self.emit(
            EventType::NodeSkipped,
            execution_id,
            Some(node_id),
            json!({ "status": "skipped", "reason": reason }),
        );
    }

    async fn on_interactive_prompt(
        &self,
        execution_id: &ExecutionId,
        node_id: &NodeId,
        prompt: &str,
        context: &Value,
    ) {
        self.emit(
            EventType::InteractivePrompt,
            execution_id,
            Some(node_id),
            json!({ "prompt": prompt, "context": context }),
        );
    }

    async fn on_interactive_prompt_timeout(&self, execution_id: &ExecutionId, node_id: &NodeId) {
        self.emit(
            EventType::InteractivePromptTimeout,
            execution_id,
            Some(node_id),
            Value::Null,
        );
    }
}
