//! Persistence and lookup collaborator.
//!
//! The hub consumes a `ChatStore` for saving messages and resolving
//! participants and display names. Every call is made under a caller-supplied
//! deadline; see [`with_deadline`].

use crate::message::{ConversationId, StoredMessage, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Conversation does not exist.
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    /// User does not exist.
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    /// Conversation would violate a model constraint.
    #[error("Invalid conversation: {0}")]
    InvalidConversation(&'static str),

    /// Call did not complete before its deadline.
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    /// Backend failure.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// The persistence/lookup collaborator consumed by the hub.
#[async_trait]
pub trait ChatStore: Send + Sync + 'static {
    /// Durably save a message, assigning its id and send time.
    async fn save_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
    ) -> Result<StoredMessage, StoreError>;

    /// Current participants of a conversation.
    async fn participants(&self, conversation_id: &str) -> Result<Vec<UserId>, StoreError>;

    /// Display name of a user.
    async fn display_name(&self, user_id: &str) -> Result<String, StoreError>;

    /// Stored messages, oldest first, from the window of the `limit` newest
    /// messages after skipping `offset`.
    async fn history(
        &self,
        conversation_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// Conversations `user_id` takes part in, most recently active first.
    async fn conversations_for(&self, user_id: &str) -> Result<Vec<Conversation>, StoreError>;
}

/// Run a store call under a deadline.
///
/// # Errors
///
/// Returns the call's own error, or `StoreError::Timeout` if it did not
/// finish within `deadline`.
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| StoreError::Timeout(deadline))?
}

/// A conversation summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Conversation identifier.
    pub id: ConversationId,
    /// Member users.
    pub participants: Vec<UserId>,
    /// Creation time, or the send time of the latest saved message.
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug)]
struct ConversationRecord {
    participants: Vec<UserId>,
    last_activity: DateTime<Utc>,
    messages: Vec<StoredMessage>,
}

/// In-memory `ChatStore`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<UserId, String>,
    conversations: DashMap<ConversationId, ConversationRecord>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or rename a user.
    pub fn add_user(&self, user_id: impl Into<UserId>, display_name: impl Into<String>) {
        self.users.insert(user_id.into(), display_name.into());
    }

    /// Create a conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than two distinct participants are given or
    /// the id is already taken.
    pub fn create_conversation(
        &self,
        conversation_id: impl Into<ConversationId>,
        participants: impl IntoIterator<Item = impl Into<UserId>>,
    ) -> Result<Conversation, StoreError> {
        let id = conversation_id.into();
        let mut members: Vec<UserId> = Vec::new();
        for participant in participants {
            let participant = participant.into();
            if !members.contains(&participant) {
                members.push(participant);
            }
        }

        if members.len() < 2 {
            return Err(StoreError::InvalidConversation(
                "conversation requires at least two participants",
            ));
        }

        let now = Utc::now();
        match self.conversations.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::InvalidConversation(
                "conversation id already exists",
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ConversationRecord {
                    participants: members.clone(),
                    last_activity: now,
                    messages: Vec::new(),
                });
                debug!(conversation = %id, participants = members.len(), "Created conversation");
                Ok(Conversation {
                    id,
                    participants: members,
                    last_activity: now,
                })
            }
        }
    }

    /// Get a conversation summary.
    #[must_use]
    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.conversations.get(conversation_id).map(|record| Conversation {
            id: conversation_id.to_string(),
            participants: record.participants.clone(),
            last_activity: record.last_activity,
        })
    }

    /// Number of stored messages in a conversation.
    #[must_use]
    pub fn message_count(&self, conversation_id: &str) -> usize {
        self.conversations
            .get(conversation_id)
            .map(|record| record.messages.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn save_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
    ) -> Result<StoredMessage, StoreError> {
        let mut record = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_string()))?;

        let message = StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            sent_at: Utc::now(),
        };

        record.last_activity = message.sent_at;
        record.messages.push(message.clone());
        Ok(message)
    }

    async fn participants(&self, conversation_id: &str) -> Result<Vec<UserId>, StoreError> {
        Ok(self
            .conversations
            .get(conversation_id)
            .map(|record| record.participants.clone())
            .unwrap_or_default())
    }

    async fn display_name(&self, user_id: &str) -> Result<String, StoreError> {
        self.users
            .get(user_id)
            .map(|name| name.clone())
            .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))
    }

    async fn history(
        &self,
        conversation_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let record = self
            .conversations
            .get(conversation_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_string()))?;

        let mut window: Vec<StoredMessage> = record
            .messages
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        window.reverse();
        Ok(window)
    }

    async fn conversations_for(&self, user_id: &str) -> Result<Vec<Conversation>, StoreError> {
        let mut conversations: Vec<Conversation> = self
            .conversations
            .iter()
            .filter(|record| record.participants.iter().any(|p| p == user_id))
            .map(|record| Conversation {
                id: record.key().clone(),
                participants: record.participants.clone(),
                last_activity: record.last_activity,
            })
            .collect();
        conversations.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(conversations)
    }
}
