//! Chat message types shared by the relay, the upstream client and the store

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated message as sent to the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A message as received from a client, before validation
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

/// Validate client messages, returning the first problem found.
pub fn validate_messages(messages: &[IncomingMessage]) -> Result<Vec<ChatMessage>, String> {
    if messages.is_empty() {
        return Err("messages must be a non-empty list".to_string());
    }

    messages
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let role = Role::from_str(&m.role).map_err(|_| {
                format!("messages[{i}].role must be one of: system,user,assistant,tool")
            })?;
            if m.content.trim().is_empty() {
                return Err(format!("messages[{i}].content must be a non-empty string"));
            }
            Ok(ChatMessage::new(role, m.content.clone()))
        })
        .collect()
}

/// Content of the most recent user message, if any
pub fn last_user_text(history: &[ChatMessage]) -> Option<&str> {
    history
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
}
