//! Chat overview: a user's conversation list with recent messages.
//!
//! Each summary names the other participants and previews the latest
//! message. Recent messages are rendered exactly as the hub renders live
//! broadcasts for the same recipient.

use crate::message::{ConversationId, Rendering, UserId, SELF_LABEL, UNKNOWN_SENDER};
use crate::store::{ChatStore, StoreError};
use chrono::{DateTime, Utc};
use parley_protocol::OutboundFrame;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Contact name used when no other participant's name resolves.
pub const UNKNOWN_CONTACT: &str = "Unknown";

/// One entry of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// Conversation identifier.
    pub id: ConversationId,
    /// The user the overview was built for.
    pub user_id: UserId,
    /// Display names of the other participants, comma separated.
    pub contact_name: String,
    /// Body of the latest message, empty for a silent conversation.
    pub last_message: String,
    /// Formatted send time of the latest message, empty for a silent
    /// conversation.
    pub timestamp: String,
}

/// Conversation list plus the recent messages of each conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChatOverview {
    /// Summaries, most recently active first.
    pub conversations: Vec<ConversationSummary>,
    /// Recent messages per conversation, oldest first. Conversations
    /// without messages have no entry.
    pub messages: BTreeMap<ConversationId, Vec<OutboundFrame>>,
}

/// Build the overview for `user_id`, with up to `recent` messages per
/// conversation.
///
/// Unresolvable display names fall back to placeholders instead of failing
/// the whole overview.
///
/// # Errors
///
/// Returns an error if the conversation list or a conversation's history
/// cannot be read.
pub async fn chat_overview(
    store: &dyn ChatStore,
    user_id: &str,
    recent: usize,
    now: DateTime<Utc>,
) -> Result<ChatOverview, StoreError> {
    let mut names: HashMap<UserId, Option<String>> = HashMap::new();
    let mut overview = ChatOverview::default();

    for conversation in store.conversations_for(user_id).await? {
        let mut contacts = Vec::new();
        for participant in conversation.participants.iter().filter(|p| *p != user_id) {
            if let Some(name) = resolve_name(store, &mut names, participant).await {
                contacts.push(name);
            }
        }
        let contact_name = if contacts.is_empty() {
            UNKNOWN_CONTACT.to_string()
        } else {
            contacts.join(", ")
        };

        let history = store.history(&conversation.id, recent, 0).await?;
        let mut views = Vec::with_capacity(history.len());
        for message in &history {
            let sender_name = resolve_name(store, &mut names, &message.sender_id)
                .await
                .unwrap_or_else(|| UNKNOWN_SENDER.to_string());
            let rendering = Rendering {
                sender_name: &sender_name,
                self_label: SELF_LABEL,
                now,
            };
            views.push(message.view_for(user_id, &rendering));
        }

        let (last_message, timestamp) = match (history.last(), views.last()) {
            (Some(message), Some(view)) => (message.content.clone(), view.timestamp.clone()),
            _ => (String::new(), String::new()),
        };

        overview.conversations.push(ConversationSummary {
            id: conversation.id.clone(),
            user_id: user_id.to_string(),
            contact_name,
            last_message,
            timestamp,
        });
        if !views.is_empty() {
            overview.messages.insert(conversation.id, views);
        }
    }

    debug!(
        user = %user_id,
        conversations = overview.conversations.len(),
        "Built chat overview"
    );
    Ok(overview)
}

async fn resolve_name(
    store: &dyn ChatStore,
    cache: &mut HashMap<UserId, Option<String>>,
    user_id: &str,
) -> Option<String> {
    if let Some(known) = cache.get(user_id) {
        return known.clone();
    }
    let name = match store.display_name(user_id).await {
        Ok(name) => Some(name),
        Err(e) => {
            debug!(user = %user_id, error = %e, "Display name unavailable");
            None
        }
    };
    cache.insert(user_id.to_string(), name.clone());
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seeded_store, Script, ScriptedStore};
    use parley_protocol::Direction;

    #[tokio::test]
    async fn test_overview_lists_conversations_by_activity() {
        let store = seeded_store();
        store.create_conversation("c3", ["u2", "u1", "u3"]).unwrap();
        store.save_message("c1", "u1", "hi bob").await.unwrap();
        store.save_message("c1", "u2", "hi alice").await.unwrap();

        let overview = chat_overview(&store, "u2", 20, Utc::now()).await.unwrap();
        let ids: Vec<&str> = overview.conversations.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c3", "c2"]);

        let c1 = &overview.conversations[0];
        assert_eq!(c1.user_id, "u2");
        assert_eq!(c1.contact_name, "Alice");
        assert_eq!(c1.last_message, "hi alice");
        assert!(!c1.timestamp.is_empty());

        let c3 = &overview.conversations[1];
        assert_eq!(c3.contact_name, "Alice, Carol");
        assert_eq!(c3.last_message, "");
        assert_eq!(c3.timestamp, "");

        let views = &overview.messages["c1"];
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].from, "Alice");
        assert_eq!(views[0].direction, Direction::Incoming);
        assert_eq!(views[1].from, "You");
        assert_eq!(views[1].text, "hi alice");
        assert_eq!(views[1].direction, Direction::Outgoing);
        assert!(!overview.messages.contains_key("c2"));
        assert!(!overview.messages.contains_key("c3"));
    }

    #[tokio::test]
    async fn test_overview_keeps_only_recent_messages() {
        let store = seeded_store();
        for text in ["one", "two", "three"] {
            store.save_message("c1", "u1", text).await.unwrap();
        }

        let overview = chat_overview(&store, "u1", 2, Utc::now()).await.unwrap();
        let texts: Vec<&str> = overview.messages["c1"].iter().map(|v| v.text.as_str()).collect();
        assert_eq!(texts, vec!["two", "three"]);
        assert_eq!(overview.conversations[0].last_message, "three");
    }

    #[tokio::test]
    async fn test_overview_falls_back_when_names_fail() {
        let store = ScriptedStore::new(Script {
            fail_names: true,
            ..Script::default()
        });
        store.inner().save_message("c1", "u2", "hey").await.unwrap();

        let overview = chat_overview(&store, "u1", 20, Utc::now()).await.unwrap();
        assert_eq!(overview.conversations[0].contact_name, UNKNOWN_CONTACT);
        assert_eq!(overview.messages["c1"][0].from, UNKNOWN_SENDER);

        // One lookup per user, however many times it appears.
        let lookups = store.calls().iter().filter(|c| c.starts_with("name:")).count();
        assert_eq!(lookups, 1);
    }

    #[tokio::test]
    async fn test_overview_for_user_without_conversations() {
        let store = seeded_store();
        let overview = chat_overview(&store, "u9", 20, Utc::now()).await.unwrap();
        assert!(overview.conversations.is_empty());
        assert!(overview.messages.is_empty());
    }
}
