//! # dipeo-state - Execution-state registry
//!
//! Durable, cached persistence for diagram executions. One row per
//! execution holds the status, per-node states, node outputs, variables and
//! accumulated LLM token usage; a secondary message store absorbs payloads
//! too large to keep inline (the envelope then carries a
//! `conversation_ref`).
//!
//! Backends:
//!
//! - [`SqliteStateStore`] - sqlx/SQLite with WAL journalling. All database
//!   work funnels through a single-connection pool, so writes are
//!   serialised without explicit locking.
//! - [`InMemoryStateStore`] - map-backed store for tests and embedded use.
//!
//! Both sit behind the [`StateStore`] trait consumed by the engine's
//! state-store observer. Active executions are additionally held in a TTL
//! [`ExecutionCache`]; a terminal status transition marks the execution
//! inactive, persists it and evicts it from the cache.

pub mod cache;
pub mod error;
pub mod memory;
pub mod message_store;
pub mod models;
pub mod sqlite;
pub mod store;

pub use cache::ExecutionCache;
pub use error::{Result, StateError};
pub use memory::InMemoryStateStore;
pub use message_store::{InMemoryMessageStore, MessageStore, SqliteMessageStore, StoredMessage};
pub use models::{ExecutionFilter, ExecutionState, ExecutionStatus, NodeState, NodeStatus};
pub use sqlite::SqliteStateStore;
pub use store::{StateStore, DEFAULT_MAX_INLINE_BYTES};
