//! Secondary message store.
//!
//! Holds conversation messages and any envelope body too large for the
//! inline `node_outputs` JSON column (the large-payload rule). Spilled
//! envelopes keep a `{"ref": message_id}` body plus a `conversation_ref` in
//! their metadata so readers can resolve them later.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dipeo_core::envelope::{Envelope, EnvelopeBody};
use dipeo_core::ids::ExecutionId;
use dipeo_core::usage::TokenUsage;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

/// A persisted message row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub execution_id: ExecutionId,
    pub person_id: String,
    pub from_person_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_person_id: Option<String>,
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

impl StoredMessage {
    pub fn new(
        execution_id: ExecutionId,
        person_id: impl Into<String>,
        from_person_id: impl Into<String>,
        role: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            execution_id,
            person_id: person_id.into(),
            from_person_id: from_person_id.into(),
            to_person_id: None,
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
            node_id: None,
            token_usage: None,
        }
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message, returning its id.
    async fn put(&self, message: StoredMessage) -> Result<String>;

    async fn get(&self, id: &str) -> Result<Option<StoredMessage>>;

    async fn list_for_execution(&self, execution_id: &ExecutionId) -> Result<Vec<StoredMessage>>;
}

/// Spill an oversized envelope body into the message store, replacing it
/// with a reference. Bodies at or under `max_inline_bytes` pass through
/// untouched.
pub(crate) async fn spill_large_body(
    store: &dyn MessageStore,
    execution_id: &ExecutionId,
    envelope: &Envelope,
    max_inline_bytes: usize,
) -> Result<Envelope> {
    if envelope.body.size_hint() <= max_inline_bytes {
        return Ok(envelope.clone());
    }

    let content = match &envelope.body {
        EnvelopeBody::Text(s) => s.clone(),
        other => other.to_value().to_string(),
    };

    let mut message = StoredMessage::new(
        execution_id.clone(),
        "_output",
        "system",
        "output",
        content,
    );
    message.node_id = Some(envelope.produced_by.as_str().to_string());
    let message_id = store.put(message).await?;

    let mut spilled = envelope.clone();
    spilled.body = EnvelopeBody::Json(json!({ "ref": message_id }));
    spilled.meta.conversation_ref = Some(message_id);
    Ok(spilled)
}

/// Map-backed message store for tests and embedded use.
#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: DashMap<String, StoredMessage>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn put(&self, message: StoredMessage) -> Result<String> {
        let id = message.id.clone();
        self.messages.insert(id.clone(), message);
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<StoredMessage>> {
        Ok(self.messages.get(id).map(|m| m.clone()))
    }

    async fn list_for_execution(&self, execution_id: &ExecutionId) -> Result<Vec<StoredMessage>> {
        let mut messages: Vec<StoredMessage> = self
            .messages
            .iter()
            .filter(|m| &m.execution_id == execution_id)
            .map(|m| m.clone())
            .collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(messages)
    }
}

/// SQLite-backed message store sharing the registry's connection pool.
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                person_id TEXT NOT NULL,
                from_person_id TEXT NOT NULL,
                to_person_id TEXT,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                node_id TEXT,
                token_usage TEXT
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_execution ON messages(execution_id)")
            .execute(&pool)
            .await?;
        Ok(Self { pool })
    }

    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<StoredMessage> {
        let timestamp: String = row.try_get("timestamp")?;
        let token_usage: Option<String> = row.try_get("token_usage")?;
        Ok(StoredMessage {
            id: row.try_get("id")?,
            execution_id: ExecutionId::new(row.try_get::<String, _>("execution_id")?),
            person_id: row.try_get("person_id")?,
            from_person_id: row.try_get("from_person_id")?,
            to_person_id: row.try_get("to_person_id")?,
            role: row.try_get("role")?,
            content: row.try_get("content")?,
            timestamp: timestamp
                .parse()
                .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC),
            node_id: row.try_get("node_id")?,
            token_usage: match token_usage {
                Some(raw) => serde_json::from_str(&raw)?,
                None => None,
            },
        })
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn put(&self, message: StoredMessage) -> Result<String> {
        let token_usage = message
            .token_usage
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT OR REPLACE INTO messages
             (id, execution_id, person_id, from_person_id, to_person_id,
              role, content, timestamp, node_id, token_usage)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(message.execution_id.as_str())
        .bind(&message.person_id)
        .bind(&message.from_person_id)
        .bind(&message.to_person_id)
        .bind(&message.role)
        .bind(&message.content)
        .bind(message.timestamp.to_rfc3339())
        .bind(&message.node_id)
        .bind(&token_usage)
        .execute(&self.pool)
        .await?;
        Ok(message.id)
    }

    async fn get(&self, id: &str) -> Result<Option<StoredMessage>> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_message).transpose()
    }

    async fn list_for_execution(&self, execution_id: &ExecutionId) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE execution_id = ? ORDER BY timestamp ASC",
        )
        .bind(execution_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_message).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dipeo_core::ids::NodeId;

    #[tokio::test]
    async fn test_memory_put_get() {
        let store = InMemoryMessageStore::new();
        let message = StoredMessage::new(ExecutionId::new("e1"), "p1", "system", "user", "hi");
        let id = store.put(message.clone()).await.unwrap();
        let back = store.get(&id).await.unwrap().unwrap();
        assert_eq!(back, message);
    }

    #[tokio::test]
    async fn test_sqlite_round_trip() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = SqliteMessageStore::new(pool).await.unwrap();

        let mut message =
            StoredMessage::new(ExecutionId::new("e1"), "p1", "p2", "assistant", "hello");
        message.token_usage = Some(TokenUsage::new(3, 2));
        message.node_id = Some("n1".into());

        let id = store.put(message.clone()).await.unwrap();
        let back = store.get(&id).await.unwrap().unwrap();
        assert_eq!(back.content, "hello");
        assert_eq!(back.token_usage, Some(TokenUsage::new(3, 2)));

        let listed = store.list_for_execution(&ExecutionId::new("e1")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(store
            .list_for_execution(&ExecutionId::new("other"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_spill_large_body() {
        let store = InMemoryMessageStore::new();
        let big = "x".repeat(200);
        let envelope = Envelope::text(NodeId::new("n1"), big.clone());

        let spilled = spill_large_body(&store, &ExecutionId::new("e1"), &envelope, 64)
            .await
            .unwrap();

        let reference = spilled.meta.conversation_ref.clone().unwrap();
        assert_eq!(
            spilled.body.as_json().unwrap()["ref"],
            serde_json::json!(reference)
        );
        let stored = store.get(&reference).await.unwrap().unwrap();
        assert_eq!(stored.content, big);
        assert_eq!(stored.node_id.as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn test_small_body_not_spilled() {
        let store = InMemoryMessageStore::new();
        let envelope = Envelope::text(NodeId::new("n1"), "small");
        let kept = spill_large_body(&store, &ExecutionId::new("e1"), &envelope, 64)
            .await
            .unwrap();
        assert_eq!(kept, envelope);
        assert!(kept.meta.conversation_ref.is_none());
    }
}
