//! # parley-transport
//!
//! Transport abstraction layer for the Parley chat hub.
//!
//! A live session is split into two halves that never share a lock:
//!
//! - **FrameReader** - The sole reader of the underlying transport
//! - **FrameWriter** - The sole writer of the underlying transport
//!
//! Implementations:
//!
//! - **WebSocket** - axum's upgraded websocket, split into halves
//! - **Memory** - An in-process duplex used by tests and benchmarks
//!
//! ```rust,ignore
//! use parley_transport::{FrameReader, WireFrame};
//!
//! async fn drain(mut reader: impl FrameReader) {
//!     while let Ok(Some(frame)) = reader.recv().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{FrameReader, FrameWriter, TransportError, WireFrame};
