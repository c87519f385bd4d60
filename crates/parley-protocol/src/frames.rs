//! Frame types for the Parley protocol.
//!
//! Inbound frames are client submissions; outbound frames are per-recipient
//! views of a message that has already been persisted.

use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;

/// Canonical name of the only inbound frame kind the hub accepts.
pub const NEW_MESSAGE: &str = "newMessage";

/// Every spelling of the new-message kind that clients send.
pub const NEW_MESSAGE_KINDS: [&str; 2] = [NEW_MESSAGE, "new message"];

/// Whether `kind` names a new-message frame.
#[must_use]
pub fn is_new_message(kind: &str) -> bool {
    NEW_MESSAGE_KINDS.contains(&kind)
}

/// A frame received from a client.
///
/// Every field defaults when absent so that validation can report which
/// required field is missing instead of failing the whole decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundFrame {
    /// Frame kind, carried in the `type` key.
    #[serde(rename = "type", alias = "kind", default)]
    pub kind: String,
    /// Target conversation.
    #[serde(alias = "conversationId", default)]
    pub conversation_id: String,
    /// Client-asserted sender. Never trusted.
    #[serde(
        alias = "senderId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sender_id: Option<String>,
    /// Message body.
    #[serde(default)]
    pub content: String,
}

impl InboundFrame {
    /// Create a `newMessage` frame.
    #[must_use]
    pub fn new_message(conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: NEW_MESSAGE.to_string(),
            conversation_id: conversation_id.into(),
            sender_id: None,
            content: content.into(),
        }
    }

    /// Validate the frame and strip it down to a submission.
    ///
    /// The client-supplied `sender_id` is discarded here; the caller stamps
    /// the authenticated identity.
    ///
    /// # Errors
    ///
    /// Returns an error for any kind other than `newMessage` (or its
    /// spaced spelling `new message`), or when the conversation id or
    /// content is empty.
    pub fn into_submission(self) -> Result<Submission, ProtocolError> {
        if !is_new_message(&self.kind) {
            return Err(ProtocolError::UnsupportedKind(self.kind));
        }
        if self.conversation_id.is_empty() {
            return Err(ProtocolError::MissingField("conversation_id"));
        }
        if self.content.is_empty() {
            return Err(ProtocolError::MissingField("content"));
        }
        Ok(Submission {
            conversation_id: self.conversation_id,
            content: self.content,
        })
    }
}

/// A validated client submission, not yet attributed to a sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Target conversation.
    pub conversation_id: String,
    /// Message body.
    pub content: String,
}

/// Whether a recipient is looking at its own message or someone else's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Sent by another participant.
    Incoming,
    /// Sent by the recipient itself.
    Outgoing,
}

impl Direction {
    /// Direction of a message from `sender_id` as seen by `recipient_id`.
    #[must_use]
    pub fn between(sender_id: &str, recipient_id: &str) -> Self {
        if sender_id == recipient_id {
            Direction::Outgoing
        } else {
            Direction::Incoming
        }
    }

    /// Get the wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

/// A message rendered for a single recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFrame {
    /// Sender label: a display name, or the self label for the sender's own
    /// connections.
    pub from: String,
    /// Message body.
    pub text: String,
    /// Human-readable send time.
    pub timestamp: String,
    /// Per-recipient direction.
    pub direction: Direction,
}
