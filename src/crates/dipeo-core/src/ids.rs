//! Opaque identifier types, one newtype per concept.
//!
//! IDs are plain strings on the wire but distinct types in code so an
//! `ExecutionId` can never be passed where a `NodeId` is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifies one execution of a diagram.
    ExecutionId
);
string_id!(
    /// Identifies a node within a diagram.
    NodeId
);
string_id!(
    /// Identifies an edge (arrow) within a diagram.
    ArrowId
);
string_id!(
    /// Identifies a connection handle on a node.
    HandleId
);
string_id!(
    /// Identifies a person (configured LLM agent).
    PersonId
);
string_id!(
    /// Identifies a diagram.
    DiagramId
);
string_id!(
    /// Identifies a stored API key.
    ApiKeyId
);

impl ExecutionId {
    /// Generate a fresh random execution id.
    pub fn generate() -> Self {
        Self(format!("exec_{}", uuid::Uuid::new_v4().simple()))
    }
}
