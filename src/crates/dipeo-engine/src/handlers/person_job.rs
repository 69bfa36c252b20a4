//! `person_job` nodes run one LLM turn for a configured person.
//!
//! Turn shape: apply the person's forget mode, ensure the system prompt is
//! in the log, fold any inbound conversation state into the person's
//! memory, render and append the user prompt, build the LLM-visible
//! message list, call the LLM port, append the assistant reply, and emit
//! the reply text (with token usage) on `default`.
//!
//! Conversation-state edges carry memory between persons: an inbound
//! envelope on a `conversation_state` edge is merged into this person's
//! log (see [`merge_upstream_conversation`]), and when any outgoing edge
//! is `conversation_state`-typed the person's history for this execution
//! is emitted on the `conversation` port.
//!
//! Config (`extra`): `person` (required), `prompt`, `first_only_prompt`
//! (used on the first iteration only), `forget_mode`, `llm_options`.

use super::{extra_str, render_template, template_vars};
use crate::handler::{HandlerContext, NodeHandler};
use crate::ports::LlmRequest;
use async_trait::async_trait;
use dipeo_conversation::{ForgetMode, HistoryFilter, Message, MessageRole, Speaker};
use dipeo_core::diagram::{Diagram, Node, NodeType};
use dipeo_core::envelope::{ContentType, Envelope, PortMap, PORT_CONVERSATION, PORT_DEFAULT};
use dipeo_core::error::ExecutionError;
use dipeo_core::ids::PersonId;
use serde_json::Value;
use tracing::debug;

pub struct PersonJobHandler;

#[async_trait]
impl NodeHandler for PersonJobHandler {
    fn node_type(&self) -> NodeType {
        NodeType::PersonJob
    }

    fn required_services(&self) -> &'static [&'static str] {
        &["llm"]
    }

    fn validate_config(&self, node: &Node) -> Result<(), ExecutionError> {
        if extra_str(&node.config.extra, "person").is_none() {
            return Err(ExecutionError::Validation(format!(
                "person_job node '{}' is missing 'person' config",
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
        let person_id = PersonId::new(extra_str(&node.config.extra, "person").ok_or_else(
            || ExecutionError::handler(node.id.clone(), "person_job is missing 'person' config"),
        )?);
        let spec = ctx.diagram.person(&person_id).cloned().ok_or_else(|| {
            ExecutionError::handler(node.id.clone(), format!("unknown person '{}'", person_id))
        })?;

        let mode = extra_str(&node.config.extra, "forget_mode")
            .and_then(ForgetMode::parse)
            .unwrap_or_default();
        let conversation = ctx.conversation();

        // Start-of-turn forgetting for repeat iterations.
        if mode == ForgetMode::OnEveryTurn && ctx.exec_count > 0 {
            conversation.forget(&person_id, Some(&ctx.execution_id), mode);
        }

        if let Some(system_prompt) = &spec.system_prompt {
            let has_system = conversation
                .history(
                    &person_id,
                    &HistoryFilter {
                        execution_id: Some(ctx.execution_id.clone()),
                        ..Default::default()
                    },
                )
                .iter()
                .any(|m| m.is_system());
            if !has_system {
                conversation.append(
                    &person_id,
                    &ctx.execution_id,
                    MessageRole::System,
                    system_prompt.clone(),
                    Speaker::System,
                    Some(node.id.clone()),
                    None,
                );
            }
        }

        // Fold an upstream conversation into this person's memory.
        if let Some(envelope) = conversation_input(&ctx.diagram, node, &inputs) {
            match parse_conversation(envelope) {
                Some(upstream) => merge_upstream_conversation(ctx, node, &person_id, upstream),
                None => {
                    debug!(node = %node.id, "inbound conversation envelope did not parse, ignoring")
                }
            }
        }

        let template = match extra_str(&node.config.extra, "first_only_prompt") {
            Some(first) if ctx.exec_count == 0 => first,
            _ => extra_str(&node.config.extra, "prompt").unwrap_or_default(),
        };
        let prompt = render_template(template, &template_vars(&ctx.variables_snapshot(), &inputs));

        conversation.append(
            &person_id,
            &ctx.execution_id,
            MessageRole::User,
            prompt,
            Speaker::User,
            Some(node.id.clone()),
            None,
        );

        let diagram = ctx.diagram.clone();
        let label_for = move |id: &PersonId| diagram.person_label(id);
        let messages =
            conversation.prompt_view(&person_id, &ctx.execution_id, mode, &label_for);
        debug!(node = %node.id, person = %person_id, turns = messages.len(), "calling llm");

        let response = ctx
            .llm()?
            .complete(LlmRequest {
                messages,
                model: spec.model.clone(),
                api_key_id: spec.api_key_id.clone(),
                options: node
                    .config
                    .extra
                    .get("llm_options")
                    .cloned()
                    .unwrap_or(Value::Null),
            })
            .await?;

        conversation.append(
            &person_id,
            &ctx.execution_id,
            MessageRole::Assistant,
            response.text.clone(),
            Speaker::Person(person_id.clone()),
            Some(node.id.clone()),
            Some(response.usage.clone()),
        );

        let reply = Envelope::text(node.id.clone(), response.text)
            .with_trace_id(ctx.execution_id.as_str())
            .with_usage(response.usage);
        let mut outputs: PortMap = [(PORT_DEFAULT.to_string(), reply)].into_iter().collect();

        // Export this person's history whenever a conversation-state edge
        // leaves the node.
        let exports_conversation = ctx
            .diagram
            .outgoing_edges(&node.id)
            .iter()
            .any(|&edge| ctx.diagram.edge(edge).content_type == ContentType::ConversationState);
        if exports_conversation {
            let history = conversation.history(
                &person_id,
                &HistoryFilter {
                    execution_id: Some(ctx.execution_id.clone()),
                    ..Default::default()
                },
            );
            outputs.insert(
                PORT_CONVERSATION.to_string(),
                Envelope::conversation(node.id.clone(), serde_json::to_value(&history)?)
                    .with_trace_id(ctx.execution_id.as_str()),
            );
        }

        Ok(outputs)
    }
}

/// Locate the inbound envelope that arrived on a `conversation_state`
/// edge, going by the edge's declared content type rather than the port
/// name.
fn conversation_input<'a>(diagram: &Diagram, node: &Node, inputs: &'a PortMap) -> Option<&'a Envelope> {
    for &edge_ref in diagram.incoming_edges(&node.id) {
        let edge = diagram.edge(edge_ref);
        if edge.content_type != ContentType::ConversationState {
            continue;
        }
        let port = if edge.target_input.is_empty() {
            PORT_DEFAULT
        } else {
            edge.target_input.as_str()
        };
        if let Some(envelope) = inputs.get(port) {
            return Some(envelope);
        }
    }
    None
}

fn parse_conversation(envelope: &Envelope) -> Option<Vec<Message>> {
    let value = envelope.body.as_json()?;
    serde_json::from_value(value.clone()).ok()
}

/// Fold an upstream conversation into this person's own memory.
///
/// On a loop turn (the node executed before, or the upstream log already
/// contains this person's own replies) the other person's latest assistant
/// message is appended under that person's identity, which is what lets
/// `on_every_turn` consolidation label it `[label]: ...` later. On a first
/// turn the upstream exchange is summarised as plain user context instead.
fn merge_upstream_conversation(
    ctx: &HandlerContext,
    node: &Node,
    person_id: &PersonId,
    upstream: Vec<Message>,
) {
    if upstream.is_empty() {
        return;
    }
    let conversation = ctx.conversation();

    let in_loop = ctx.exec_count > 0
        || upstream.iter().any(|m| {
            m.role == MessageRole::Assistant && m.from_person_id.person() == Some(person_id)
        });

    if in_loop {
        let last_other = upstream.iter().rev().find(|m| {
            m.role == MessageRole::Assistant
                && m.from_person_id.person().is_some_and(|p| p != person_id)
        });
        if let Some(message) = last_other {
            debug!(node = %node.id, from = %message.from_person_id.as_str(), "merging other person's reply");
            conversation.append(
                person_id,
                &ctx.execution_id,
                MessageRole::Assistant,
                message.content.clone(),
                message.from_person_id.clone(),
                Some(node.id.clone()),
                None,
            );
        }
        return;
    }

    // First turn: summarise the last upstream exchange as user context.
    let mut exchange: Vec<&Message> = upstream
        .iter()
        .rev()
        .filter(|m| matches!(m.role, MessageRole::User | MessageRole::Assistant))
        .take(2)
        .collect();
    exchange.reverse();
    if exchange.is_empty() {
        return;
    }
    let context = exchange
        .iter()
        .map(|m| match m.role {
            MessageRole::User => format!("Input: {}", m.content),
            _ => format!("Response: {}", m.content),
        })
        .collect::<Vec<_>>()
        .join("\n");
    conversation.append(
        person_id,
        &ctx.execution_id,
        MessageRole::User,
        context,
        Speaker::User,
        Some(node.id.clone()),
        None,
    );
}
