//! Message types shared by the hub and connection halves.

use chrono::{DateTime, Duration, Utc};
use parley_protocol::{Direction, OutboundFrame, Submission};
use serde::{Deserialize, Serialize};

/// A user identifier, as issued by the identity provider.
pub type UserId = String;

/// A conversation identifier.
pub type ConversationId = String;

/// A persisted message identifier.
pub type MessageId = String;

/// Label shown to a sender for their own messages.
pub const SELF_LABEL: &str = "You";

/// Label used when the sender's display name cannot be resolved.
pub const UNKNOWN_SENDER: &str = "Unknown User";

/// A submission attributed to an authenticated sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSubmission {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Authenticated sender.
    pub sender_id: UserId,
    /// Message body.
    pub content: String,
}

impl ChatSubmission {
    /// Create a new submission.
    #[must_use]
    pub fn new(
        conversation_id: impl Into<ConversationId>,
        sender_id: impl Into<UserId>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            content: content.into(),
        }
    }

    /// Attribute a decoded submission to `sender_id`.
    #[must_use]
    pub fn stamped(submission: Submission, sender_id: impl Into<UserId>) -> Self {
        Self {
            conversation_id: submission.conversation_id,
            sender_id: sender_id.into(),
            content: submission.content,
        }
    }
}

/// A message that has been durably saved.
///
/// `id` and `sent_at` are assigned by the store, never by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Store-assigned identifier.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Authenticated sender.
    pub sender_id: UserId,
    /// Message body.
    pub content: String,
    /// Store-assigned save time.
    #[serde(rename = "timestamp")]
    pub sent_at: DateTime<Utc>,
}

/// Sender details shared by every recipient view of one broadcast.
#[derive(Debug, Clone, Copy)]
pub struct Rendering<'a> {
    /// Display name shown to the other participants.
    pub sender_name: &'a str,
    /// Label shown on the sender's own connections.
    pub self_label: &'a str,
    /// Reference time for timestamp formatting.
    pub now: DateTime<Utc>,
}

impl StoredMessage {
    /// Render this message for `recipient_id`.
    #[must_use]
    pub fn view_for(&self, recipient_id: &str, rendering: &Rendering<'_>) -> OutboundFrame {
        let direction = Direction::between(&self.sender_id, recipient_id);
        let from = match direction {
            Direction::Outgoing => rendering.self_label,
            Direction::Incoming => rendering.sender_name,
        };

        OutboundFrame {
            from: from.to_string(),
            text: self.content.clone(),
            timestamp: format_timestamp(self.sent_at, rendering.now),
            direction,
        }
    }
}

/// Format a send time for display.
///
/// Messages younger than a day show the clock time (`3:04 pm`), older ones
/// the date (`Jan 2`).
#[must_use]
pub fn format_timestamp(sent_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    if now.signed_duration_since(sent_at) < Duration::hours(24) {
        sent_at.format("%-I:%M %P").to_string()
    } else {
        sent_at.format("%b %-d").to_string()
    }
}
