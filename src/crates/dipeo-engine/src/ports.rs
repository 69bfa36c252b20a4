//! Collaborator ports consumed by node handlers.
//!
//! The engine is provider-agnostic: LLM, HTTP and code execution are traits
//! the embedding application implements. This module ships only the
//! contracts, a deterministic [`StubLlm`] for tests, and a minimal
//! [`LocalFilePort`] over `tokio::fs` for the `db` and `endpoint` handlers.

use async_trait::async_trait;
use dipeo_conversation::PromptMessage;
use dipeo_core::error::ExecutionError;
use dipeo_core::ids::ApiKeyId;
use dipeo_core::usage::TokenUsage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

/// Request to a chat-completion provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmRequest {
    pub messages: Vec<PromptMessage>,
    pub model: String,
    pub api_key_id: ApiKeyId,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

/// Chat-completion port. Implementations must map rate limits, 5xx and
/// connection failures to [`ExecutionError::Transient`] so the engine's
/// retry policy applies.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, ExecutionError>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub body: Value,
}

/// HTTP port with retry-aware error kinds (timeouts and connection
/// failures surface as `Transient`).
#[async_trait]
pub trait HttpPort: Send + Sync {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, ExecutionError>;
}

/// File port used by `db` and `endpoint` handlers.
#[async_trait]
pub trait FilePort: Send + Sync {
    async fn read(&self, path: &str) -> Result<String, ExecutionError>;
    async fn write(&self, path: &str, content: &str) -> Result<(), ExecutionError>;
    async fn list(&self, dir: &str, filter: Option<&str>) -> Result<Vec<String>, ExecutionError>;
}

/// Sandboxed code execution port for `code_job` nodes. The core ships no
/// sandbox; embedders provide one.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn run(&self, language: &str, code: &str, inputs: &Value) -> Result<Value, ExecutionError>;
}

/// Deterministic LLM double: returns scripted responses in order, then
/// repeats the last one.
pub struct StubLlm {
    responses: Mutex<VecDeque<LlmResponse>>,
    last: Mutex<Option<LlmResponse>>,
}

impl StubLlm {
    pub fn new(text: impl Into<String>, usage: TokenUsage) -> Self {
        Self::scripted(vec![LlmResponse {
            text: text.into(),
            usage,
            raw: None,
        }])
    }

    pub fn scripted(responses: Vec<LlmResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LlmClient for StubLlm {
    async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse, ExecutionError> {
        if let Some(next) = self.responses.lock().pop_front() {
            *self.last.lock() = Some(next.clone());
            return Ok(next);
        }
        self.last
            .lock()
            .clone()
            .ok_or_else(|| ExecutionError::Validation("stub llm has no scripted responses".into()))
    }
}

/// File port rooted at a directory, backed by `tokio::fs`.
pub struct LocalFilePort {
    root: PathBuf,
}

impl LocalFilePort {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl FilePort for LocalFilePort {
    async fn read(&self, path: &str) -> Result<String, ExecutionError> {
        let full = self.resolve(path);
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ExecutionError::NotFound(format!("file '{}'", path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &str, content: &str) -> Result<(), ExecutionError> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content).await?;
        Ok(())
    }

    async fn list(&self, dir: &str, filter: Option<&str>) -> Result<Vec<String>, ExecutionError> {
        let mut entries = tokio::fs::read_dir(self.resolve(dir)).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if filter.map_or(true, |f| name.contains(f)) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}
