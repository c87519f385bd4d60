//! # parley-protocol
//!
//! Wire protocol definitions for the Parley chat hub.
//!
//! Clients and the server exchange JSON text frames over a websocket.
//!
//! ## Frame Types
//!
//! - `InboundFrame` - A submission sent by a client (`type = "newMessage"`,
//!   or `"new message"`)
//! - `OutboundFrame` - A persisted message rendered for one recipient
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::codec;
//!
//! let text = r#"{"type":"newMessage","conversation_id":"c1","content":"hi"}"#;
//! let submission = codec::decode_submission(text).unwrap();
//! assert_eq!(submission.conversation_id, "c1");
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, decode_submission, encode, ProtocolError};
pub use frames::{
    is_new_message, Direction, InboundFrame, OutboundFrame, Submission, NEW_MESSAGE,
    NEW_MESSAGE_KINDS,
};
