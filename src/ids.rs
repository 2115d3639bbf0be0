//! Newtyped identifiers
//!
//! Thin wrappers around `String`/`Uuid` so session, conversation, block and
//! client identity can't be accidentally swapped at a call site.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new_random() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(SessionId);
string_id!(BlockId);
string_id!(ToolUseId);
string_id!(SubagentId);
string_id!(ClientId);
string_id!(AgentProfileRef);

/// Identifies a conversation within a session: the main conversation or a
/// subagent's child conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ConversationId {
    Main,
    Subagent(SubagentId),
}

impl ConversationId {
    pub fn as_str(&self) -> &str {
        match self {
            ConversationId::Main => "main",
            ConversationId::Subagent(id) => id.as_str(),
        }
    }

    pub fn is_main(&self) -> bool {
        matches!(self, ConversationId::Main)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<ConversationId> for String {
    fn from(id: ConversationId) -> Self {
        id.as_str().to_string()
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        if s == "main" {
            ConversationId::Main
        } else {
            ConversationId::Subagent(SubagentId(s))
        }
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_id_roundtrips_main() {
        let id = ConversationId::Main;
        let s: String = id.clone().into();
        assert_eq!(s, "main");
        assert_eq!(ConversationId::from(s), id);
    }

    #[test]
    fn conversation_id_roundtrips_subagent() {
        let id = ConversationId::Subagent(SubagentId::from("sub-1"));
        let s: String = id.clone().into();
        assert_eq!(ConversationId::from(s), id);
    }

    #[test]
    fn session_id_display() {
        let id = SessionId::from("abc");
        assert_eq!(format!("{id}"), "abc");
    }
}
