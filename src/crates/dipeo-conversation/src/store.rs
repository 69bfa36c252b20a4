//! The conversation store.

use crate::forgetting::ForgetMode;
use crate::message::{Message, MessageRole, PromptMessage, Speaker};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dipeo_core::ids::{ExecutionId, NodeId, PersonId};
use dipeo_core::usage::TokenUsage;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Oldest messages are evicted past this many per person.
pub const DEFAULT_MAX_MESSAGES_PER_PERSON: usize = 100;

/// Filter for [`ConversationStore::history`].
#[derive(Clone, Debug, Default)]
pub struct HistoryFilter {
    pub execution_id: Option<ExecutionId>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Per-person ordered message log with forgetting strategies.
///
/// Each person's log sits behind its own mutex; operations on different
/// persons never contend.
pub struct ConversationStore {
    logs: DashMap<PersonId, Mutex<Vec<Message>>>,
    max_messages_per_person: usize,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::with_max_messages(DEFAULT_MAX_MESSAGES_PER_PERSON)
    }

    pub fn with_max_messages(max_messages_per_person: usize) -> Self {
        Self {
            logs: DashMap::new(),
            max_messages_per_person,
        }
    }

    /// Append a message to `person_id`'s log, evicting the oldest entries
    /// past the per-person cap.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &self,
        person_id: &PersonId,
        execution_id: &ExecutionId,
        role: MessageRole,
        content: impl Into<String>,
        from: Speaker,
        node_id: Option<NodeId>,
        token_usage: Option<TokenUsage>,
    ) -> Message {
        let message = Message {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            from_person_id: from,
            to_person_id: Some(person_id.clone()),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            execution_id: execution_id.clone(),
            node_id,
            token_usage,
        };

        let entry = self.logs.entry(person_id.clone()).or_insert_with(|| Mutex::new(Vec::new()));
        let mut log = entry.lock();
        log.push(message.clone());
        let excess = log.len().saturating_sub(self.max_messages_per_person);
        if excess > 0 {
            warn!(person = %person_id, evicted = excess, "conversation cap reached, evicting oldest messages");
            log.drain(..excess);
        }
        message
    }

    /// Messages for a person in timestamp order, optionally filtered.
    pub fn history(&self, person_id: &PersonId, filter: &HistoryFilter) -> Vec<Message> {
        let Some(entry) = self.logs.get(person_id) else {
            return Vec::new();
        };
        let log = entry.lock();
        let mut messages: Vec<Message> = log
            .iter()
            .filter(|m| {
                filter
                    .execution_id
                    .as_ref()
                    .map_or(true, |e| &m.execution_id == e)
                    && filter.since.map_or(true, |since| m.timestamp >= since)
            })
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        if let Some(limit) = filter.limit {
            let skip = messages.len().saturating_sub(limit);
            messages.drain(..skip);
        }
        messages
    }

    /// Apply a forgetting strategy to the person's log, optionally scoped
    /// to one execution. `no_forget` and `upon_request` are no-ops.
    pub fn forget(&self, person_id: &PersonId, execution_id: Option<&ExecutionId>, mode: ForgetMode) {
        let Some(entry) = self.logs.get(person_id) else {
            return;
        };
        let mut log = entry.lock();

        let in_scope = |m: &Message| execution_id.map_or(true, |e| &m.execution_id == e);

        match mode {
            ForgetMode::NoForget | ForgetMode::UponRequest => {}
            ForgetMode::All => {
                log.retain(|m| !in_scope(m) || m.is_system());
            }
            ForgetMode::OwnOnly => {
                log.retain(|m| {
                    !in_scope(m) || m.from_person_id.person() != Some(person_id)
                });
            }
            ForgetMode::OnEveryTurn => {
                let last_user_id = log
                    .iter()
                    .rev()
                    .find(|m| in_scope(m) && m.role == MessageRole::User)
                    .map(|m| m.id.clone());
                log.retain(|m| {
                    !in_scope(m) || m.is_system() || Some(&m.id) == last_user_id.as_ref()
                });
            }
        }
        debug!(person = %person_id, ?mode, remaining = log.len(), "applied forgetting");
    }

    /// Build the LLM-visible message list for a person's next turn.
    ///
    /// For `on_every_turn` this is: system messages, then one consolidated
    /// block holding the most recent assistant message from each *other*
    /// person (labelled `[label]: ...`), then the latest user message.
    pub fn prompt_view(
        &self,
        person_id: &PersonId,
        execution_id: &ExecutionId,
        mode: ForgetMode,
        label_for: &dyn Fn(&PersonId) -> String,
    ) -> Vec<PromptMessage> {
        let history = self.history(
            person_id,
            &HistoryFilter {
                execution_id: Some(execution_id.clone()),
                ..Default::default()
            },
        );

        match mode {
            ForgetMode::NoForget | ForgetMode::UponRequest => history
                .iter()
                .map(|m| PromptMessage::new(m.role, m.content.clone()))
                .collect(),
            ForgetMode::OwnOnly => history
                .iter()
                .filter(|m| m.from_person_id.person() != Some(person_id))
                .map(|m| PromptMessage::new(m.role, m.content.clone()))
                .collect(),
            ForgetMode::All => history
                .iter()
                .filter(|m| m.is_system())
                .map(|m| PromptMessage::new(m.role, m.content.clone()))
                .collect(),
            ForgetMode::OnEveryTurn => {
                let mut view: Vec<PromptMessage> = history
                    .iter()
                    .filter(|m| m.is_system())
                    .map(|m| PromptMessage::new(m.role, m.content.clone()))
                    .collect();

                // Latest assistant message from each other person, in the
                // order each person last spoke.
                let mut latest_by_person: HashMap<PersonId, &Message> = HashMap::new();
                for message in &history {
                    if message.role != MessageRole::Assistant {
                        continue;
                    }
                    if let Some(other) = message.from_person_id.person() {
                        if other != person_id {
                            latest_by_person.insert(other.clone(), message);
                        }
                    }
                }
                let mut latest: Vec<(&PersonId, &Message)> =
                    latest_by_person.iter().map(|(p, m)| (p, *m)).collect();
                latest.sort_by(|a, b| a.1.timestamp.cmp(&b.1.timestamp));

                if !latest.is_empty() {
                    let block = latest
                        .iter()
                        .map(|&(person, message)| {
                            format!("[{}]: {}", label_for(person), message.content)
                        })
                        .collect::<Vec<_>>()
                        .join("\n\n");
                    view.push(PromptMessage::new(MessageRole::User, block));
                }

                if let Some(last_user) = history
                    .iter()
                    .rev()
                    .find(|m| m.role == MessageRole::User)
                {
                    view.push(PromptMessage::new(MessageRole::User, last_user.content.clone()));
                }

                view
            }
        }
    }

    /// Export every person's messages for one execution as a JSON log
    /// file; returns the path written.
    pub async fn save_conversation_log(
        &self,
        execution_id: &ExecutionId,
        dir: &Path,
    ) -> io::Result<PathBuf> {
        let mut conversations = serde_json::Map::new();
        for entry in self.logs.iter() {
            let log = entry.value().lock();
            let messages: Vec<&Message> = log
                .iter()
                .filter(|m| &m.execution_id == execution_id)
                .collect();
            if messages.is_empty() {
                continue;
            }
            conversations.insert(
                entry.key().as_str().to_string(),
                serde_json::to_value(&messages)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            );
        }

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("conversation_{}_{}.json", execution_id, stamp));
        let payload = json!({
            "execution_id": execution_id,
            "timestamp": stamp.to_string(),
            "conversations": conversations,
        });

        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, serde_json::to_vec_pretty(&payload)?).await?;
        Ok(path)
    }

    pub fn clear_all(&self) {
        self.logs.clear();
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}
