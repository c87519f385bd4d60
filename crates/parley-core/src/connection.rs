//! Connection halves.
//!
//! An admitted session runs as two tasks:
//!
//! - the **read half** is the only reader of the transport. It decodes
//!   submissions, stamps them with the authenticated sender and offers them
//!   to the hub. It also owns the liveness deadline, which only a pong
//!   extends.
//! - the **write half** is the only writer of the transport. It drains the
//!   outbound queue the hub fills and sends a ping every period.
//!
//! Either half exiting cancels a shared shutdown token so the other follows.
//! Only the read half asks the hub to unregister the session.

use crate::hub::{HubError, HubHandle};
use crate::message::{ChatSubmission, UserId};
use crate::registry::SessionHandle;
use bytes::Bytes;
use parley_protocol::codec;
use parley_transport::{FrameReader, FrameWriter, TransportError, WireFrame};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// A user identity that an upstream authenticator has already verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    user_id: UserId,
}

impl Identity {
    /// Wrap a verified user id.
    #[must_use]
    pub fn verified(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    /// The verified user id.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

/// Per-connection limits and timings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Largest inbound frame accepted, in bytes.
    pub max_frame_size: usize,
    /// How long the peer may go without acknowledging a ping.
    pub pong_wait: Duration,
    /// Interval between pings. Must be shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Deadline for a single transport write.
    pub write_wait: Duration,
    /// How long a submission may wait for hub intake capacity.
    pub submit_wait: Duration,
    /// Capacity of the outbound queue.
    pub outbound_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            max_frame_size: codec::MAX_FRAME_SIZE,
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_wait: Duration::from_secs(10),
            submit_wait: Duration::from_secs(2),
            outbound_capacity: 256,
        }
    }
}

/// Why the read half stopped.
#[derive(Debug)]
pub enum ReadExit {
    /// Peer sent a close frame or ended the stream.
    PeerClosed,
    /// No pong arrived before the liveness deadline.
    LivenessExpired,
    /// Reading failed, or a frame broke the size limit.
    Transport(TransportError),
    /// The write half stopped first.
    Shutdown,
}

/// Why the write half stopped.
#[derive(Debug)]
pub enum WriteExit {
    /// The hub closed the outbound queue.
    QueueClosed,
    /// Writing a frame or ping failed.
    Transport(TransportError),
    /// The read half stopped first.
    Shutdown,
}

/// An admitted, registered session.
#[derive(Debug)]
pub struct Connection {
    session: SessionHandle,
    user_id: UserId,
    reader: JoinHandle<ReadExit>,
    writer: JoinHandle<WriteExit>,
}

impl Connection {
    /// Register a verified session with the hub and start both halves.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Closed` if the hub has stopped. The transport halves
    /// are dropped in that case.
    pub async fn admit<R, W>(
        hub: HubHandle,
        identity: Identity,
        reader: R,
        writer: W,
        config: ConnectionConfig,
    ) -> Result<Self, HubError>
    where
        R: FrameReader + 'static,
        W: FrameWriter + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let session = hub.register(identity.user_id(), outbound_tx).await?;
        let shutdown = CancellationToken::new();

        info!(session = %session, user = %identity.user_id(), "Connection admitted");

        let writer = tokio::spawn(write_half(
            writer,
            outbound_rx,
            shutdown.clone(),
            session,
            identity.user_id.clone(),
            config.clone(),
        ));
        let reader = tokio::spawn(read_half(
            reader,
            hub,
            shutdown,
            session,
            identity.user_id.clone(),
            config,
        ));

        Ok(Self {
            session,
            user_id: identity.user_id,
            reader,
            writer,
        })
    }

    /// The hub session handle.
    #[must_use]
    pub fn session(&self) -> SessionHandle {
        self.session
    }

    /// The authenticated user.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Wait for both halves to stop.
    ///
    /// # Errors
    ///
    /// Returns an error if either task panicked or was aborted.
    pub async fn join(self) -> Result<(ReadExit, WriteExit), JoinError> {
        let read = self.reader.await?;
        let write = self.writer.await?;
        Ok((read, write))
    }
}

async fn read_half<R: FrameReader>(
    mut reader: R,
    hub: HubHandle,
    shutdown: CancellationToken,
    session: SessionHandle,
    user_id: UserId,
    config: ConnectionConfig,
) -> ReadExit {
    let mut deadline = Instant::now() + config.pong_wait;

    let exit = loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break ReadExit::Shutdown,
            next = tokio::time::timeout_at(deadline, reader.recv()) => next,
        };

        let frame = match next {
            Err(_) => break ReadExit::LivenessExpired,
            Ok(Err(e)) => break ReadExit::Transport(e),
            Ok(Ok(None)) => break ReadExit::PeerClosed,
            Ok(Ok(Some(frame))) => frame,
        };
        let kind = frame.kind();

        let size = match &frame {
            WireFrame::Text(text) => text.len(),
            WireFrame::Binary(data) => data.len(),
            _ => 0,
        };
        if size > config.max_frame_size {
            debug!(session = %session, user = %user_id, kind, size, "Frame over limit");
            break ReadExit::Transport(TransportError::FrameTooLarge {
                size,
                limit: config.max_frame_size,
            });
        }

        match frame {
            WireFrame::Text(text) => {
                forward(&hub, &session, &user_id, &text, config.submit_wait).await;
            }
            WireFrame::Pong(_) => {
                deadline = Instant::now() + config.pong_wait;
                trace!(session = %session, user = %user_id, "Pong received");
            }
            WireFrame::Close => break ReadExit::PeerClosed,
            // The transport answers pings itself.
            WireFrame::Binary(_) | WireFrame::Ping(_) => {
                debug!(session = %session, user = %user_id, kind, "Ignoring frame");
            }
        }
    };

    match &exit {
        ReadExit::Transport(e) => warn!(session = %session, user = %user_id, error = %e, "Read failed"),
        other => debug!(session = %session, user = %user_id, reason = ?other, "Read half stopping"),
    }

    hub.unregister(session).await;
    shutdown.cancel();
    drop(reader);

    info!(session = %session, user = %user_id, "Connection closed");
    exit
}

async fn forward(
    hub: &HubHandle,
    session: &SessionHandle,
    user_id: &str,
    text: &str,
    wait: Duration,
) {
    let submission = match codec::decode_submission(text) {
        Ok(submission) => submission,
        Err(e) => {
            debug!(session = %session, user = %user_id, error = %e, "Discarding inbound frame");
            return;
        }
    };

    let submission = ChatSubmission::stamped(submission, user_id);
    let conversation_id = submission.conversation_id.clone();

    match hub.submit(submission, wait).await {
        Ok(()) => trace!(
            session = %session,
            user = %user_id,
            conversation = %conversation_id,
            "Submission handed to hub"
        ),
        Err(e) => {
            hub.stats().record_dropped();
            warn!(
                session = %session,
                user = %user_id,
                conversation = %conversation_id,
                error = %e,
                "Submission dropped"
            );
        }
    }
}

async fn write_half<W: FrameWriter>(
    mut writer: W,
    mut outbound: mpsc::Receiver<String>,
    shutdown: CancellationToken,
    session: SessionHandle,
    user_id: UserId,
    config: ConnectionConfig,
) -> WriteExit {
    // `interval_at` panics on a zero period.
    let ping_period = config.ping_period.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_period, ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit = loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(payload) => {
                    if let Err(e) = send_with_deadline(&mut writer, WireFrame::Text(payload), config.write_wait).await {
                        break WriteExit::Transport(e);
                    }
                }
                None => {
                    debug!(session = %session, user = %user_id, "Outbound queue closed by hub");
                    close_with_deadline(&mut writer, config.write_wait).await;
                    break WriteExit::QueueClosed;
                }
            },
            _ = ticker.tick() => {
                trace!(session = %session, user = %user_id, "Sending ping");
                if let Err(e) = send_with_deadline(&mut writer, WireFrame::Ping(Bytes::new()), config.write_wait).await {
                    break WriteExit::Transport(e);
                }
            }
            _ = shutdown.cancelled() => {
                close_with_deadline(&mut writer, config.write_wait).await;
                break WriteExit::Shutdown;
            }
        }
    };

    if let WriteExit::Transport(e) = &exit {
        warn!(session = %session, user = %user_id, error = %e, "Write failed");
    }
    shutdown.cancel();
    exit
}

async fn send_with_deadline<W: FrameWriter>(
    writer: &mut W,
    frame: WireFrame,
    deadline: Duration,
) -> Result<(), TransportError> {
    tokio::time::timeout(deadline, writer.send(frame))
        .await
        .map_err(|_| TransportError::Timeout)?
}

async fn close_with_deadline<W: FrameWriter>(writer: &mut W, deadline: Duration) {
    match tokio::time::timeout(deadline, writer.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Close frame not delivered"),
        Err(_) => debug!("Close frame timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{Hub, HubConfig, HubStatsSnapshot};
    use crate::store::ChatStore;
    use crate::testing::{seeded_store, Script, ScriptedStore};
    use parley_protocol::{Direction, OutboundFrame};
    use parley_transport::memory::{duplex, MemoryPeer};
    use std::sync::Arc;

    const HI: &str = r#"{"type":"newMessage","conversation_id":"c1","content":"hi"}"#;

    fn outbound(frame: Option<WireFrame>) -> OutboundFrame {
        match frame {
            Some(WireFrame::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    async fn open(hub: &HubHandle, user: &str, config: ConnectionConfig) -> (Connection, MemoryPeer) {
        let (reader, writer, peer) = duplex(16);
        let connection = Connection::admit(hub.clone(), Identity::verified(user), reader, writer, config)
            .await
            .unwrap();
        (connection, peer)
    }

    async fn wait_until(hub: &HubHandle, done: impl Fn(HubStatsSnapshot) -> bool) {
        for _ in 0..10_000 {
            if done(hub.stats().snapshot()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached: {:?}", hub.stats().snapshot());
    }

    #[tokio::test]
    async fn test_both_participants_connected() {
        let (hub, _task) = Hub::spawn(Arc::new(seeded_store()), HubConfig::default());
        let (_c1, mut alice) = open(&hub, "u1", ConnectionConfig::default()).await;
        let (_c2, mut bob) = open(&hub, "u2", ConnectionConfig::default()).await;

        alice.send_text(HI).await.unwrap();

        let own = outbound(alice.recv().await);
        assert_eq!(own.from, "You");
        assert_eq!(own.text, "hi");
        assert_eq!(own.direction, Direction::Outgoing);

        let other = outbound(bob.recv().await);
        assert_eq!(other.from, "Alice");
        assert_eq!(other.text, "hi");
        assert_eq!(other.direction, Direction::Incoming);
    }

    #[tokio::test]
    async fn test_spaced_kind_reaches_both_participants() {
        let store = Arc::new(seeded_store());
        let (hub, _task) = Hub::spawn(store.clone(), HubConfig::default());
        let (_c1, mut alice) = open(&hub, "u1", ConnectionConfig::default()).await;
        let (_c2, mut bob) = open(&hub, "u2", ConnectionConfig::default()).await;

        alice
            .send_text(r#"{"kind":"new message","conversationId":"c1","content":"hi"}"#)
            .await
            .unwrap();

        let own = outbound(alice.recv().await);
        assert_eq!(own.from, "You");
        assert_eq!(own.text, "hi");
        assert_eq!(own.direction, Direction::Outgoing);

        let other = outbound(bob.recv().await);
        assert_eq!(other.from, "Alice");
        assert_eq!(other.text, "hi");
        assert_eq!(other.direction, Direction::Incoming);

        let history = store.history("c1", 1, 0).await.unwrap();
        assert_eq!(history[0].sender_id, "u1");
        assert_eq!(history[0].content, "hi");
    }

    #[tokio::test]
    async fn test_offline_participant_gets_nothing_and_sender_sees_no_error() {
        let store = Arc::new(seeded_store());
        let (hub, _task) = Hub::spawn(store.clone(), HubConfig::default());
        let (_c1, mut alice) = open(&hub, "u1", ConnectionConfig::default()).await;

        alice.send_text(HI).await.unwrap();

        assert_eq!(outbound(alice.recv().await).direction, Direction::Outgoing);
        assert!(alice.try_recv().is_none());
        assert_eq!(store.history("c1", 50, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_client_asserted_sender_is_ignored() {
        let store = Arc::new(seeded_store());
        let (hub, _task) = Hub::spawn(store.clone(), HubConfig::default());
        let (_c1, mut alice) = open(&hub, "u1", ConnectionConfig::default()).await;
        let (_c2, mut bob) = open(&hub, "u2", ConnectionConfig::default()).await;

        bob.send_text(r#"{"type":"newMessage","conversation_id":"c1","sender_id":"u1","content":"it was me"}"#)
            .await
            .unwrap();

        let seen_by_alice = outbound(alice.recv().await);
        assert_eq!(seen_by_alice.from, "Bob");
        assert_eq!(seen_by_alice.direction, Direction::Incoming);
        assert_eq!(outbound(bob.recv().await).from, "You");

        let history = store.history("c1", 1, 0).await.unwrap();
        assert_eq!(history[0].sender_id, "u2");
    }

    #[tokio::test]
    async fn test_invalid_frames_are_discarded() {
        let store = Arc::new(seeded_store());
        let (hub, _task) = Hub::spawn(store.clone(), HubConfig::default());
        let (_c1, mut alice) = open(&hub, "u1", ConnectionConfig::default()).await;

        alice.send_text("not json").await.unwrap();
        alice
            .send_text(r#"{"type":"typing","conversation_id":"c1","content":"..."}"#)
            .await
            .unwrap();
        alice
            .send_text(r#"{"type":"newMessage","conversation_id":"c1"}"#)
            .await
            .unwrap();
        alice
            .send_text(r#"{"type":"newMessage","content":"where to?"}"#)
            .await
            .unwrap();
        alice
            .send(WireFrame::Binary(Bytes::from_static(b"\x00\x01")))
            .await
            .unwrap();
        alice.send_text(HI).await.unwrap();

        assert_eq!(outbound(alice.recv().await).text, "hi");
        assert_eq!(store.message_count("c1"), 1);
    }

    #[tokio::test]
    async fn test_peer_close_unregisters_and_sends_close() {
        let (hub, _task) = Hub::spawn(Arc::new(seeded_store()), HubConfig::default());
        let (connection, mut alice) = open(&hub, "u1", ConnectionConfig::default()).await;
        wait_until(&hub, |s| s.sessions == 1).await;

        alice.send(WireFrame::Close).await.unwrap();
        let (read, write) = connection.join().await.unwrap();

        assert!(matches!(read, ReadExit::PeerClosed));
        assert!(matches!(write, WriteExit::QueueClosed | WriteExit::Shutdown));
        assert_eq!(alice.recv().await, Some(WireFrame::Close));
        wait_until(&hub, |s| s.sessions == 0).await;
    }

    #[tokio::test]
    async fn test_read_error_tears_down() {
        let (hub, _task) = Hub::spawn(Arc::new(seeded_store()), HubConfig::default());
        let (connection, alice) = open(&hub, "u1", ConnectionConfig::default()).await;

        alice
            .fail(TransportError::ReceiveFailed("connection reset".into()))
            .await
            .unwrap();
        let (read, _write) = connection.join().await.unwrap();

        assert!(matches!(read, ReadExit::Transport(TransportError::ReceiveFailed(_))));
        wait_until(&hub, |s| s.sessions == 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_deadline_expires_without_pong() {
        let (hub, _task) = Hub::spawn(Arc::new(seeded_store()), HubConfig::default());
        let (connection, mut alice) = open(&hub, "u1", ConnectionConfig::default()).await;

        let (read, _write) = connection.join().await.unwrap();
        assert!(matches!(read, ReadExit::LivenessExpired));

        assert!(matches!(alice.recv().await, Some(WireFrame::Ping(_))));
        assert_eq!(alice.recv().await, Some(WireFrame::Close));
        wait_until(&hub, |s| s.sessions == 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pongs_keep_session_alive() {
        let (hub, _task) = Hub::spawn(Arc::new(seeded_store()), HubConfig::default());
        let (connection, alice) = open(&hub, "u1", ConnectionConfig::default()).await;

        let (to_server, mut from_server) = alice.into_split();
        let responder = tokio::spawn(async move {
            while let Some(frame) = from_server.recv().await {
                if let WireFrame::Ping(data) = frame {
                    if to_server.send(Ok(WireFrame::Pong(data))).await.is_err() {
                        break;
                    }
                }
            }
        });

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(hub.stats().snapshot().sessions, 1);

        responder.abort();
        let (read, _write) = connection.join().await.unwrap();
        assert!(matches!(read, ReadExit::PeerClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_unblocks_reader() {
        let (hub, _task) = Hub::spawn(Arc::new(seeded_store()), HubConfig::default());
        let (connection, alice) = open(&hub, "u1", ConnectionConfig::default()).await;

        // Keep the inbound side open but stop accepting writes.
        let (_to_server, from_server) = alice.into_split();
        drop(from_server);

        let (read, write) = connection.join().await.unwrap();
        assert!(matches!(read, ReadExit::Shutdown));
        assert!(matches!(write, WriteExit::Transport(TransportError::ConnectionClosed)));
        wait_until(&hub, |s| s.sessions == 0).await;
    }

    #[tokio::test]
    async fn test_oversized_frame_tears_down() {
        let (hub, _task) = Hub::spawn(Arc::new(seeded_store()), HubConfig::default());
        let config = ConnectionConfig {
            max_frame_size: 32,
            ..ConnectionConfig::default()
        };
        let (connection, alice) = open(&hub, "u1", config).await;

        alice.send_text("x".repeat(64)).await.unwrap();
        let (read, _write) = connection.join().await.unwrap();

        assert!(matches!(
            read,
            ReadExit::Transport(TransportError::FrameTooLarge { size: 64, limit: 32 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_reader_is_evicted_others_keep_receiving() {
        let (hub, _task) = Hub::spawn(Arc::new(seeded_store()), HubConfig::default());

        // Alice never reads: one frame fits in the transport, one in the queue.
        let (reader, writer, _stalled) = duplex(1);
        let config = ConnectionConfig {
            outbound_capacity: 1,
            ..ConnectionConfig::default()
        };
        let slow = Connection::admit(hub.clone(), Identity::verified("u1"), reader, writer, config)
            .await
            .unwrap();
        let (_c2, mut bob) = open(&hub, "u2", ConnectionConfig::default()).await;

        for n in 0..4 {
            hub.submit(
                ChatSubmission::new("c1", "u2", format!("msg {n}")),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        }

        for n in 0..4 {
            assert_eq!(outbound(bob.recv().await).text, format!("msg {n}"));
        }
        wait_until(&hub, |s| s.evicted == 1 && s.sessions == 1).await;

        let (read, write) = slow.join().await.unwrap();
        assert!(matches!(read, ReadExit::Shutdown));
        assert!(matches!(write, WriteExit::Transport(TransportError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_dropped_when_hub_is_busy() {
        let store = Arc::new(ScriptedStore::new(Script {
            save_delay: Duration::from_secs(30),
            ..Script::default()
        }));
        let config = HubConfig {
            intake_capacity: 1,
            save_timeout: Duration::from_secs(60),
            ..HubConfig::default()
        };
        let (hub, _task) = Hub::spawn(store, config);
        let (_c1, alice) = open(&hub, "u1", ConnectionConfig::default()).await;

        for text in ["a", "b", "c"] {
            alice
                .send_text(format!(
                    r#"{{"type":"newMessage","conversation_id":"c1","content":"{text}"}}"#
                ))
                .await
                .unwrap();
        }

        wait_until(&hub, |s| s.dropped == 1).await;
        wait_until(&hub, |s| s.persisted == 2).await;
        assert_eq!(hub.stats().snapshot().dropped, 1);
    }

    #[tokio::test]
    async fn test_admission_fails_when_hub_stopped() {
        let (hub, state) = Hub::new(Arc::new(seeded_store()), HubConfig::default());
        drop(state);

        let (reader, writer, mut peer) = duplex(4);
        let result = Connection::admit(
            hub,
            Identity::verified("u1"),
            reader,
            writer,
            ConnectionConfig::default(),
        )
        .await;

        assert!(matches!(result, Err(HubError::Closed)));
        assert!(peer.recv().await.is_none());
    }
}
