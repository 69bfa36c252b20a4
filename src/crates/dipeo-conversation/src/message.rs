//! Conversation message types.

use chrono::{DateTime, Utc};
use dipeo_core::ids::{ExecutionId, NodeId, PersonId};
use dipeo_core::usage::TokenUsage;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Chat role of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// Who authored a message: a configured person, the system, or the human
/// user. Serialised as a bare string (`"system"`, `"user"`, or the person
/// id).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Speaker {
    Person(PersonId),
    System,
    User,
}

impl Speaker {
    pub fn as_str(&self) -> &str {
        match self {
            Speaker::Person(id) => id.as_str(),
            Speaker::System => "system",
            Speaker::User => "user",
        }
    }

    pub fn person(&self) -> Option<&PersonId> {
        match self {
            Speaker::Person(id) => Some(id),
            _ => None,
        }
    }
}

impl From<&str> for Speaker {
    fn from(value: &str) -> Self {
        match value {
            "system" => Speaker::System,
            "user" => Speaker::User,
            other => Speaker::Person(PersonId::new(other)),
        }
    }
}

impl Serialize for Speaker {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Speaker {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Err(D::Error::custom("speaker must not be empty"));
        }
        Ok(Speaker::from(raw.as_str()))
    }
}

/// One entry in a person's conversation log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from_person_id: Speaker,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_person_id: Option<PersonId>,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub execution_id: ExecutionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

impl Message {
    pub fn is_system(&self) -> bool {
        self.role == MessageRole::System
    }
}

/// The LLM-visible shape of a message after forgetting has been applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: MessageRole,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speaker_serialises_as_string() {
        assert_eq!(serde_json::to_value(Speaker::System).unwrap(), "system");
        assert_eq!(serde_json::to_value(Speaker::User).unwrap(), "user");
        assert_eq!(
            serde_json::to_value(Speaker::Person(PersonId::new("p1"))).unwrap(),
            "p1"
        );
    }

    #[test]
    fn test_speaker_round_trip() {
        for speaker in [
            Speaker::System,
            Speaker::User,
            Speaker::Person(PersonId::new("p9")),
        ] {
            let json = serde_json::to_string(&speaker).unwrap();
            let back: Speaker = serde_json::from_str(&json).unwrap();
            assert_eq!(back, speaker);
        }
    }
}
