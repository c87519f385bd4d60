//! Transport abstraction traits for Parley.
//!
//! These traits define the interface that every transport half must provide,
//! allowing connection tasks to be transport-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// A transport-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// UTF-8 text payload.
    Text(String),
    /// Binary payload. Parley never sends these and ignores inbound ones.
    Binary(Bytes),
    /// Liveness check sent by either peer.
    Ping(Bytes),
    /// Answer to a ping.
    Pong(Bytes),
    /// Protocol close frame.
    Close,
}

impl WireFrame {
    /// Short name used in logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            WireFrame::Text(_) => "text",
            WireFrame::Binary(_) => "binary",
            WireFrame::Ping(_) => "ping",
            WireFrame::Pong(_) => "pong",
            WireFrame::Close => "close",
        }
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Write did not complete before its deadline.
    #[error("Write timed out")]
    Timeout,

    /// Inbound frame exceeded the configured limit.
    #[error("Frame too large: {size} bytes (max: {limit})")]
    FrameTooLarge { size: usize, limit: usize },

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

/// The read half of a session's transport.
#[async_trait]
pub trait FrameReader: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` when the peer ended the stream.
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError>;
}

/// The write half of a session's transport.
#[async_trait]
pub trait FrameWriter: Send {
    /// Send a single frame.
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError>;

    /// Send a protocol close frame and shut the write side down.
    ///
    /// Closing an already closed writer is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;
}
