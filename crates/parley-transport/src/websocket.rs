//! WebSocket transport implementation.
//!
//! Adapts an upgraded axum websocket into a `FrameReader` / `FrameWriter`
//! pair. The halves are independent: reading never waits on a writer lock.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::debug;

use crate::traits::{FrameReader, FrameWriter, TransportError, WireFrame};

/// Split an upgraded websocket into its read and write halves.
#[must_use]
pub fn split(socket: WebSocket) -> (WebSocketReader, WebSocketWriter) {
    let (sink, stream) = socket.split();
    (
        WebSocketReader { stream },
        WebSocketWriter { sink, closed: false },
    )
}

/// The read half of a websocket.
pub struct WebSocketReader {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameReader for WebSocketReader {
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError> {
        match self.stream.next().await {
            Some(Ok(message)) => Ok(Some(from_message(message))),
            Some(Err(e)) => Err(TransportError::ReceiveFailed(e.to_string())),
            None => {
                debug!("WebSocket stream ended");
                Ok(None)
            }
        }
    }
}

/// The write half of a websocket.
pub struct WebSocketWriter {
    sink: SplitSink<WebSocket, Message>,
    closed: bool,
}

#[async_trait]
impl FrameWriter for WebSocketWriter {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        self.sink
            .send(into_message(frame))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.sink
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }
}

fn from_message(message: Message) -> WireFrame {
    match message {
        Message::Text(text) => WireFrame::Text(text),
        Message::Binary(data) => WireFrame::Binary(Bytes::from(data)),
        Message::Ping(data) => WireFrame::Ping(Bytes::from(data)),
        Message::Pong(data) => WireFrame::Pong(Bytes::from(data)),
        Message::Close(_) => WireFrame::Close,
    }
}

fn into_message(frame: WireFrame) -> Message {
    match frame {
        WireFrame::Text(text) => Message::Text(text),
        WireFrame::Binary(data) => Message::Binary(data.to_vec()),
        WireFrame::Ping(data) => Message::Ping(data.to_vec()),
        WireFrame::Pong(data) => Message::Pong(data.to_vec()),
        WireFrame::Close => Message::Close(None),
    }
}
