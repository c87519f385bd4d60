//! Codec for encoding and decoding Parley frames.
//!
//! Frames travel as JSON inside websocket text messages, one frame per
//! message.

use thiserror::Error;

use crate::frames::{InboundFrame, OutboundFrame, Submission};

/// Default maximum inbound frame size (4 KiB).
pub const MAX_FRAME_SIZE: usize = 4 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),

    /// JSON decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[source] serde_json::Error),

    /// Frame kind the hub does not handle.
    #[error("Unsupported frame kind: {0:?}")]
    UnsupportedKind(String),

    /// A required field is missing or empty.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

/// Decode an inbound frame without validating it.
///
/// # Errors
///
/// Returns an error if the text is not a JSON object of the expected shape.
pub fn decode(text: &str) -> Result<InboundFrame, ProtocolError> {
    serde_json::from_str(text).map_err(ProtocolError::Decode)
}

/// Decode and validate an inbound submission.
///
/// # Errors
///
/// Returns an error if the frame is malformed, of another kind, or missing
/// required fields.
pub fn decode_submission(text: &str) -> Result<Submission, ProtocolError> {
    decode(text)?.into_submission()
}

/// Encode an outbound frame to JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(frame: &OutboundFrame) -> Result<String, ProtocolError> {
    serde_json::to_string(frame).map_err(ProtocolError::Encode)
}
