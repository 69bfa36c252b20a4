//! LLM token-usage accounting.

use serde::{Deserialize, Serialize};

/// Token counts for one or more LLM calls.
///
/// `total` is always kept equal to `input + output`; `cached` tracks
/// prompt-cache hits separately and does not contribute to `total`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<u64>,
    pub total: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            cached: None,
            total: input + output,
        }
    }

    pub fn with_cached(mut self, cached: u64) -> Self {
        self.cached = Some(cached);
        self
    }

    /// Componentwise accumulation, re-deriving `total`.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.cached = match (self.cached, other.cached) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
        };
        self.total = self.input + self.output;
    }

    pub fn is_empty(&self) -> bool {
        self.input == 0 && self.output == 0 && self.cached.unwrap_or(0) == 0
    }
}
