//! # parley-core
//!
//! Broadcast hub, session registry and connection halves for Parley.
//!
//! - **Hub** - Single task that owns the registry and fans messages out
//! - **Registry** - Generation-checked arena of live sessions
//! - **Connection** - Read and write halves of one admitted session
//! - **Store** - The persistence and lookup collaborator
//! - **Message** - Submissions, stored messages and per-recipient views
//! - **Overview** - A user's conversation list with recent messages
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ submit ┌─────────────┐ save/lookup ┌─────────────┐
//! │  Read half  │───────▶│     Hub     │────────────▶│  ChatStore  │
//! └─────────────┘        └─────────────┘             └─────────────┘
//!                               │ try_send
//!                               ▼
//!                        ┌─────────────┐
//!                        │ Write half  │───▶ transport
//!                        └─────────────┘
//! ```

pub mod connection;
pub mod hub;
pub mod message;
pub mod overview;
pub mod registry;
pub mod store;

#[cfg(test)]
mod testing;

pub use connection::{Connection, ConnectionConfig, Identity, ReadExit, WriteExit};
pub use hub::{
    BroadcastError, BroadcastReport, Hub, HubConfig, HubError, HubHandle, HubStats,
    HubStatsSnapshot,
};
pub use message::{ChatSubmission, ConversationId, MessageId, StoredMessage, UserId};
pub use overview::{chat_overview, ChatOverview, ConversationSummary};
pub use registry::{RegistryFull, SessionEntry, SessionHandle, SessionRegistry};
pub use store::{ChatStore, Conversation, MemoryStore, StoreError};
