//! In-process duplex transport.
//!
//! `duplex` returns the two server-side halves plus a `MemoryPeer` that plays
//! the client. Each direction is a bounded channel, so a peer that stops
//! reading eventually stalls the writer exactly like a slow socket would.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::traits::{FrameReader, FrameWriter, TransportError, WireFrame};

/// Create a connected reader/writer pair and the peer driving them.
#[must_use]
pub fn duplex(capacity: usize) -> (MemoryReader, MemoryWriter, MemoryPeer) {
    let (to_server, from_peer) = mpsc::channel(capacity);
    let (to_peer, from_server) = mpsc::channel(capacity);

    (
        MemoryReader { rx: from_peer },
        MemoryWriter {
            tx: Some(to_peer),
        },
        MemoryPeer {
            tx: to_server,
            rx: from_server,
        },
    )
}

/// The server-side read half.
pub struct MemoryReader {
    rx: mpsc::Receiver<Result<WireFrame, TransportError>>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError> {
        match self.rx.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// The server-side write half.
pub struct MemoryWriter {
    tx: Option<mpsc::Sender<WireFrame>>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.tx.take() {
            Some(tx) => tx
                .send(WireFrame::Close)
                .await
                .map_err(|_| TransportError::ConnectionClosed),
            None => Ok(()),
        }
    }
}

/// The client end of a memory duplex.
pub struct MemoryPeer {
    tx: mpsc::Sender<Result<WireFrame, TransportError>>,
    rx: mpsc::Receiver<WireFrame>,
}

impl MemoryPeer {
    /// Send a frame to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server-side reader is gone.
    pub async fn send(&self, frame: WireFrame) -> Result<(), TransportError> {
        self.tx
            .send(Ok(frame))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Send a text frame to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server-side reader is gone.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.send(WireFrame::Text(text.into())).await
    }

    /// Make the server's next read fail with `error`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server-side reader is gone.
    pub async fn fail(&self, error: TransportError) -> Result<(), TransportError> {
        self.tx
            .send(Err(error))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Receive the next frame written by the server.
    ///
    /// Returns `None` once the server writer is dropped or closed and drained.
    pub async fn recv(&mut self) -> Option<WireFrame> {
        self.rx.recv().await
    }

    /// Receive the next frame without waiting.
    pub fn try_recv(&mut self) -> Option<WireFrame> {
        self.rx.try_recv().ok()
    }

    /// Split into independently owned halves.
    #[must_use]
    pub fn into_split(
        self,
    ) -> (
        mpsc::Sender<Result<WireFrame, TransportError>>,
        mpsc::Receiver<WireFrame>,
    ) {
        (self.tx, self.rx)
    }
}
