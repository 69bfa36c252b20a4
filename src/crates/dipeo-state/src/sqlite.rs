//! SQLite-backed state registry.
//!
//! One row per execution with JSON columns for node states, node outputs,
//! variables and token usage. All database work goes through a
//! single-connection pool (WAL journal mode), which serialises writes the
//! same way a dedicated executor thread would. Active executions are served
//! from the TTL hot cache; terminal transitions persist and evict.

use crate::cache::ExecutionCache;
use crate::error::{Result, StateError};
use crate::message_store::{spill_large_body, MessageStore};
use crate::models::{ExecutionFilter, ExecutionState, ExecutionStatus, NodeState, NodeStatus};
use crate::store::{StateStore, DEFAULT_MAX_INLINE_BYTES};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dipeo_core::envelope::Envelope;
use dipeo_core::ids::{DiagramId, ExecutionId, NodeId};
use dipeo_core::usage::TokenUsage;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS execution_states (
    execution_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    diagram_id TEXT,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    node_states TEXT NOT NULL,
    node_outputs TEXT NOT NULL,
    token_usage TEXT NOT NULL,
    error TEXT,
    variables TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 0
)";

pub struct SqliteStateStore {
    pool: SqlitePool,
    cache: ExecutionCache,
    message_store: Option<Arc<dyn MessageStore>>,
    max_inline_bytes: usize,
}

impl SqliteStateStore {
    /// Connect to a sqlx SQLite URL (`sqlite:path/to.db` or
    /// `sqlite::memory:`), creating the file and schema as needed.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Wrap an existing pool, initialising the schema.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_execution_status ON execution_states(status)")
            .execute(&pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_execution_started_at ON execution_states(started_at)",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            cache: ExecutionCache::new(),
            message_store: None,
            max_inline_bytes: DEFAULT_MAX_INLINE_BYTES,
        })
    }

    pub fn with_message_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.message_store = Some(store);
        self
    }

    pub fn with_max_inline_bytes(mut self, bytes: usize) -> Self {
        self.max_inline_bytes = bytes;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_state(row: &SqliteRow) -> Result<ExecutionState> {
        let status: String = row.try_get("status")?;
        let started_at: String = row.try_get("started_at")?;
        let ended_at: Option<String> = row.try_get("ended_at")?;
        let node_states: String = row.try_get("node_states")?;
        let node_outputs: String = row.try_get("node_outputs")?;
        let token_usage: String = row.try_get("token_usage")?;
        let variables: String = row.try_get("variables")?;
        let diagram_id: Option<String> = row.try_get("diagram_id")?;
        let is_active: i64 = row.try_get("is_active")?;

        let node_states: HashMap<NodeId, NodeState> = serde_json::from_str(&node_states)?;
        let node_outputs: HashMap<NodeId, Envelope> = serde_json::from_str(&node_outputs)?;
        let token_usage: TokenUsage = serde_json::from_str(&token_usage)?;
        let variables: HashMap<String, Value> = serde_json::from_str(&variables)?;

        Ok(ExecutionState {
            id: ExecutionId::new(row.try_get::<String, _>("execution_id")?),
            diagram_id: diagram_id.map(DiagramId::new),
            status: ExecutionStatus::parse(&status).unwrap_or(ExecutionStatus::Failed),
            started_at: parse_timestamp(&started_at),
            ended_at: ended_at.as_deref().map(parse_timestamp),
            node_states,
            node_outputs,
            variables,
            token_usage,
            error: row.try_get("error")?,
            is_active: is_active != 0,
        })
    }

    async fn persist(&self, state: &ExecutionState) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO execution_states
             (execution_id, status, diagram_id, started_at, ended_at,
              node_states, node_outputs, token_usage, error, variables, is_active)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(state.id.as_str())
        .bind(state.status.as_str())
        .bind(state.diagram_id.as_ref().map(|d| d.as_str()))
        .bind(state.started_at.to_rfc3339())
        .bind(state.ended_at.map(|t| t.to_rfc3339()))
        .bind(serde_json::to_string(&state.node_states)?)
        .bind(serde_json::to_string(&state.node_outputs)?)
        .bind(serde_json::to_string(&state.token_usage)?)
        .bind(&state.error)
        .bind(serde_json::to_string(&state.variables)?)
        .bind(if state.is_active { 1i64 } else { 0i64 })
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, id: &ExecutionId) -> Result<Option<ExecutionState>> {
        let row = sqlx::query("SELECT * FROM execution_states WHERE execution_id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_state).transpose()
    }

    async fn modify(
        &self,
        id: &ExecutionId,
        f: impl FnOnce(&mut ExecutionState) -> Result<()> + Send,
    ) -> Result<()> {
        let mut state = self
            .get_state(id)
            .await?
            .ok_or_else(|| StateError::NotFound(id.clone()))?;
        f(&mut state)?;
        self.save_state(&state).await
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse().unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC)
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn create_execution(
        &self,
        id: &ExecutionId,
        diagram_id: Option<&DiagramId>,
        variables: HashMap<String, Value>,
    ) -> Result<ExecutionState> {
        let state = ExecutionState::new(id.clone(), diagram_id.cloned(), variables);
        self.save_state(&state).await?;
        Ok(state)
    }

    async fn get_state(&self, id: &ExecutionId) -> Result<Option<ExecutionState>> {
        if let Some(cached) = self.cache.get(id) {
            return Ok(Some(cached));
        }
        self.load(id).await
    }

    async fn save_state(&self, state: &ExecutionState) -> Result<()> {
        if state.is_active {
            self.cache.set(state.clone());
        } else {
            self.cache.remove(&state.id);
        }
        self.persist(state).await
    }

    async fn update_status(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<()> {
        let mut state = self
            .get_state(id)
            .await?
            .ok_or_else(|| StateError::NotFound(id.clone()))?;
        if state.status.is_terminal() {
            return Err(StateError::AlreadyFinished(id.clone()));
        }
        state.set_status(status, error);
        debug!(execution = %id, status = status.as_str(), "execution status updated");
        self.save_state(&state).await
    }

    async fn update_node_status(
        &self,
        id: &ExecutionId,
        node_id: &NodeId,
        status: NodeStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.modify(id, |state| {
            state.node_state_mut(node_id).transition(status, error);
            Ok(())
        })
        .await
    }

    async fn update_node_output(
        &self,
        id: &ExecutionId,
        node_id: &NodeId,
        envelope: &Envelope,
        usage: Option<&TokenUsage>,
    ) -> Result<()> {
        let stored = match &self.message_store {
            Some(store) => {
                spill_large_body(store.as_ref(), id, envelope, self.max_inline_bytes).await?
            }
            None => envelope.clone(),
        };
        self.modify(id, move |state| {
            state.node_outputs.insert(node_id.clone(), stored);
            if let Some(usage) = usage {
                state.token_usage.add(usage);
            }
            Ok(())
        })
        .await
    }

    async fn update_variables(
        &self,
        id: &ExecutionId,
        variables: HashMap<String, Value>,
    ) -> Result<()> {
        self.modify(id, move |state| {
            state.variables = variables;
            Ok(())
        })
        .await
    }

    async fn add_token_usage(&self, id: &ExecutionId, usage: &TokenUsage) -> Result<()> {
        self.modify(id, |state| {
            state.token_usage.add(usage);
            Ok(())
        })
        .await
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionState>> {
        let mut sql = String::from("SELECT * FROM execution_states");
        let mut clauses = Vec::new();
        if filter.status.is_some() {
            clauses.push("status = ?");
        }
        if filter.diagram_id.is_some() {
            clauses.push("diagram_id = ?");
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY started_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(diagram_id) = &filter.diagram_id {
            query = query.bind(diagram_id.as_str());
        }
        query = query.bind(filter.limit as i64).bind(filter.offset as i64);

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_state).collect()
    }

    async fn cleanup_old(&self, retention_days: u32) -> Result<u64> {
        let cutoff = (Utc::now() - Duration::days(retention_days as i64)).to_rfc3339();
        let result = sqlx::query("DELETE FROM execution_states WHERE started_at < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
        self.cache.prune_expired();
        Ok(result.rows_affected())
    }
}
