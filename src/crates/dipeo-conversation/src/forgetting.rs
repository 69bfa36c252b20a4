//! Forgetting strategies applied to a person's history.

use serde::{Deserialize, Serialize};

/// How a person's conversation memory is trimmed between turns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForgetMode {
    /// Keep the full history.
    #[default]
    NoForget,
    /// Keep system messages and only the latest user message; other
    /// persons' replies are consolidated into one labelled block when the
    /// prompt is built.
    OnEveryTurn,
    /// Drop the person's own messages.
    OwnOnly,
    /// Drop every non-system message.
    All,
    /// No automatic forgetting; the handler calls `forget` explicitly.
    UponRequest,
}

impl ForgetMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "no_forget" => Some(ForgetMode::NoForget),
            "on_every_turn" => Some(ForgetMode::OnEveryTurn),
            "own_only" => Some(ForgetMode::OwnOnly),
            "all" => Some(ForgetMode::All),
            "upon_request" => Some(ForgetMode::UponRequest),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(ForgetMode::parse("on_every_turn"), Some(ForgetMode::OnEveryTurn));
        assert_eq!(ForgetMode::parse("no_forget"), Some(ForgetMode::NoForget));
        assert_eq!(ForgetMode::parse("bogus"), None);
    }

    #[test]
    fn test_serde_snake_case() {
        assert_eq!(
            serde_json::to_value(ForgetMode::UponRequest).unwrap(),
            "upon_request"
        );
    }
}
