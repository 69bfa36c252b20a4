//! # dipeo-conversation - Per-person conversation memory
//!
//! The conversation store keeps an ordered message log per person (LLM
//! agent) and implements the "memory" semantics `person_job` handlers
//! depend on: at the start of each turn a handler asks for its person's
//! LLM-visible view of history, shaped by the person's
//! [`ForgetMode`](forgetting::ForgetMode):
//!
//! - `no_forget` - full history
//! - `on_every_turn` - system messages plus the latest user message, with
//!   the most recent assistant message from each *other* person collapsed
//!   into a single labelled `[label]: ...` block
//! - `own_only` - history minus the person's own messages
//! - `all` - only system messages survive
//! - `upon_request` - nothing happens automatically; the handler calls
//!   [`ConversationStore::forget`] explicitly
//!
//! Locking is per person: appends and reads on different persons never
//! contend, matching the single-writer-per-node discipline of the engine.

pub mod forgetting;
pub mod message;
pub mod store;

pub use forgetting::ForgetMode;
pub use message::{Message, MessageRole, PromptMessage, Speaker};
pub use store::{ConversationStore, HistoryFilter, DEFAULT_MAX_MESSAGES_PER_PERSON};
