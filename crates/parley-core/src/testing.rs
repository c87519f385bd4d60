//! Test doubles shared by the unit tests.

use crate::message::{StoredMessage, UserId};
use crate::store::{ChatStore, Conversation, MemoryStore, StoreError};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

/// Users `u1` (Alice), `u2` (Bob), `u3` (Carol); `c1 = {u1, u2}`,
/// `c2 = {u2, u3}`.
pub(crate) fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.add_user("u1", "Alice");
    store.add_user("u2", "Bob");
    store.add_user("u3", "Carol");
    store
        .create_conversation("c1", ["u1", "u2"])
        .expect("seed c1");
    store
        .create_conversation("c2", ["u2", "u3"])
        .expect("seed c2");
    store
}

/// Failure and latency knobs for `ScriptedStore`.
#[derive(Debug, Default)]
pub(crate) struct Script {
    pub save_delay: Duration,
    pub fail_save: bool,
    pub fail_participants: bool,
    pub participants: Option<Vec<UserId>>,
    pub fail_names: bool,
}

/// A seeded `MemoryStore` that follows a `Script` and records every call.
pub(crate) struct ScriptedStore {
    inner: MemoryStore,
    script: Script,
    calls: Mutex<Vec<String>>,
}

impl ScriptedStore {
    pub(crate) fn new(script: Script) -> Self {
        Self {
            inner: seeded_store(),
            script,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ChatStore for ScriptedStore {
    async fn save_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
    ) -> Result<StoredMessage, StoreError> {
        self.record(format!("save:{content}"));
        tokio::time::sleep(self.script.save_delay).await;
        if self.script.fail_save {
            return Err(StoreError::Unavailable("disk full".to_string()));
        }
        let message = self
            .inner
            .save_message(conversation_id, sender_id, content)
            .await?;
        self.record(format!("saved:{content}"));
        Ok(message)
    }

    async fn participants(&self, conversation_id: &str) -> Result<Vec<UserId>, StoreError> {
        self.record(format!("participants:{conversation_id}"));
        if self.script.fail_participants {
            return Err(StoreError::Unavailable("replica lag".to_string()));
        }
        match &self.script.participants {
            Some(participants) => Ok(participants.clone()),
            None => self.inner.participants(conversation_id).await,
        }
    }

    async fn display_name(&self, user_id: &str) -> Result<String, StoreError> {
        self.record(format!("name:{user_id}"));
        if self.script.fail_names {
            return Err(StoreError::UserNotFound(user_id.to_string()));
        }
        self.inner.display_name(user_id).await
    }

    async fn history(
        &self,
        conversation_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.inner.history(conversation_id, limit, offset).await
    }

    async fn conversations_for(&self, user_id: &str) -> Result<Vec<Conversation>, StoreError> {
        self.inner.conversations_for(user_id).await
    }
}
