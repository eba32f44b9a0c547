//! Conversation storage
//!
//! The relay only needs a handful of operations from storage; they are
//! captured by [`ConversationStore`]. [`MemoryStore`] keeps everything in a
//! concurrent map for the lifetime of the process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{ChatRelayError, Result};
use crate::message::{ChatMessage, Role};

/// Identifier of a stored conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(Uuid);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConversationId {
    type Err = ChatRelayError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| ChatRelayError::Validation("conversation_id must be a UUID".to_string()))
    }
}

/// A message as kept by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<&StoredMessage> for ChatMessage {
    fn from(stored: &StoredMessage) -> Self {
        ChatMessage::new(stored.role, stored.content.clone())
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create an empty, untitled conversation
    async fn create(&self) -> Result<ConversationId>;

    async fn exists(&self, id: &ConversationId) -> Result<bool>;

    /// Append messages in order; the conversation must exist
    async fn append(&self, id: &ConversationId, messages: &[ChatMessage]) -> Result<()>;

    /// All messages in arrival order
    async fn history(&self, id: &ConversationId) -> Result<Vec<ChatMessage>>;

    async fn title(&self, id: &ConversationId) -> Result<Option<String>>;

    async fn set_title(&self, id: &ConversationId, title: &str) -> Result<()>;
}

#[derive(Debug)]
struct ConversationRecord {
    title: Option<String>,
    created_at: DateTime<Utc>,
    messages: Vec<StoredMessage>,
}

/// Process-local conversation store
#[derive(Debug, Default)]
pub struct MemoryStore {
    conversations: DashMap<ConversationId, ConversationRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Stored messages with their timestamps
    pub fn messages(&self, id: &ConversationId) -> Option<Vec<StoredMessage>> {
        self.conversations
            .get(id)
            .map(|record| record.messages.clone())
    }

    pub fn created_at(&self, id: &ConversationId) -> Option<DateTime<Utc>> {
        self.conversations.get(id).map(|record| record.created_at)
    }
}

fn not_found(id: &ConversationId) -> ChatRelayError {
    ChatRelayError::Storage(format!("Conversation {id} not found"))
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create(&self) -> Result<ConversationId> {
        let id = ConversationId::new();
        self.conversations.insert(
            id,
            ConversationRecord {
                title: None,
                created_at: Utc::now(),
                messages: Vec::new(),
            },
        );
        tracing::debug!(conversation_id = %id, "Created conversation");
        Ok(id)
    }

    async fn exists(&self, id: &ConversationId) -> Result<bool> {
        Ok(self.conversations.contains_key(id))
    }

    async fn append(&self, id: &ConversationId, messages: &[ChatMessage]) -> Result<()> {
        let mut record = self.conversations.get_mut(id).ok_or_else(|| not_found(id))?;
        let now = Utc::now();
        record
            .messages
            .extend(messages.iter().map(|m| StoredMessage {
                role: m.role,
                content: m.content.clone(),
                created_at: now,
            }));
        Ok(())
    }

    async fn history(&self, id: &ConversationId) -> Result<Vec<ChatMessage>> {
        let record = self.conversations.get(id).ok_or_else(|| not_found(id))?;
        Ok(record.messages.iter().map(ChatMessage::from).collect())
    }

    async fn title(&self, id: &ConversationId) -> Result<Option<String>> {
        let record = self.conversations.get(id).ok_or_else(|| not_found(id))?;
        Ok(record.title.clone())
    }

    async fn set_title(&self, id: &ConversationId, title: &str) -> Result<()> {
        let mut record = self.conversations.get_mut(id).ok_or_else(|| not_found(id))?;
        record.title = Some(title.to_string());
        Ok(())
    }
}
