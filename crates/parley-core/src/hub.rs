//! The broadcast hub.
//!
//! A single task owns the session registry. Connections talk to it only
//! through a [`HubHandle`], whose three bounded intake channels carry
//! registrations, unregistrations and chat submissions. Every event is
//! handled to completion before the next one is taken, so a broadcast is
//! persisted, resolved and fanned out (or abandoned) before the next begins.

use crate::message::{ChatSubmission, MessageId, Rendering, UserId, SELF_LABEL, UNKNOWN_SENDER};
use crate::registry::{RegistryFull, SessionEntry, SessionHandle, SessionRegistry};
use crate::store::{with_deadline, ChatStore, StoreError};
use chrono::Utc;
use parley_protocol::codec;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Hub intake errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub task has stopped.
    #[error("Hub is closed")]
    Closed,

    /// The broadcast intake did not accept the submission in time.
    #[error("Hub intake did not accept submission within {0:?}")]
    IntakeTimeout(Duration),

    /// The broadcast intake is full.
    #[error("Hub intake is full")]
    IntakeFull,

    /// No session slot is left.
    #[error(transparent)]
    RegistryFull(#[from] RegistryFull),
}

/// Why a broadcast was abandoned.
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// The message could not be saved; it does not exist.
    #[error("Failed to save message: {0}")]
    Persist(#[source] StoreError),

    /// Participants could not be resolved; the message stays stored.
    #[error("Failed to resolve participants: {0}")]
    Participants(#[source] StoreError),

    /// The conversation has no participants; the message stays stored.
    #[error("No participants found for conversation {0}")]
    NoParticipants(String),
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each intake channel.
    pub intake_capacity: usize,
    /// Deadline for saving a message.
    pub save_timeout: Duration,
    /// Deadline for resolving participants.
    pub participants_timeout: Duration,
    /// Deadline for resolving the sender's display name.
    pub display_name_timeout: Duration,
    /// Label shown on the sender's own connections.
    pub self_label: String,
    /// Placeholder used when the display name lookup fails.
    pub unknown_sender: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            intake_capacity: 256,
            save_timeout: Duration::from_secs(5),
            participants_timeout: Duration::from_secs(3),
            display_name_timeout: Duration::from_secs(3),
            self_label: SELF_LABEL.to_string(),
            unknown_sender: UNKNOWN_SENDER.to_string(),
        }
    }
}

/// Counters published by the hub.
///
/// Any task may read these; only the hub and connection tasks bump them.
#[derive(Debug, Default)]
pub struct HubStats {
    sessions: AtomicUsize,
    persisted: AtomicU64,
    delivered: AtomicU64,
    evicted: AtomicU64,
    abandoned: AtomicU64,
    dropped: AtomicU64,
}

impl HubStats {
    /// Record a submission dropped before reaching the hub.
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy.
    #[must_use]
    pub fn snapshot(&self) -> HubStatsSnapshot {
        HubStatsSnapshot {
            sessions: self.sessions.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStatsSnapshot {
    /// Registered sessions.
    pub sessions: usize,
    /// Messages saved by broadcasts.
    pub persisted: u64,
    /// Frames enqueued to recipients.
    pub delivered: u64,
    /// Sessions evicted for a full or closed outbound queue.
    pub evicted: u64,
    /// Broadcasts abandoned before fan-out.
    pub abandoned: u64,
    /// Submissions dropped at the hub intake.
    pub dropped: u64,
}

/// Result of a completed fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Identifier assigned by the store.
    pub message_id: MessageId,
    /// Recipients the frame was enqueued for.
    pub delivered: usize,
    /// Recipients evicted during this pass.
    pub evicted: usize,
    /// Recipients skipped because their view failed to serialize.
    pub skipped: usize,
}

struct RegisterRequest {
    user_id: UserId,
    outbound: mpsc::Sender<String>,
    reply: oneshot::Sender<Result<SessionHandle, HubError>>,
}

/// Cloneable handle used to submit events to the hub.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<RegisterRequest>,
    unregister_tx: mpsc::Sender<SessionHandle>,
    broadcast_tx: mpsc::Sender<ChatSubmission>,
    stats: Arc<HubStats>,
}

impl HubHandle {
    /// Register a session whose writer drains `outbound`.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Closed` if the hub has stopped, or
    /// `HubError::RegistryFull` if no session slot is left.
    pub async fn register(
        &self,
        user_id: impl Into<UserId>,
        outbound: mpsc::Sender<String>,
    ) -> Result<SessionHandle, HubError> {
        let (reply, response) = oneshot::channel();
        self.register_tx
            .send(RegisterRequest {
                user_id: user_id.into(),
                outbound,
                reply,
            })
            .await
            .map_err(|_| HubError::Closed)?;
        response.await.map_err(|_| HubError::Closed)?
    }

    /// Request removal of a session. Unknown or stale handles are ignored.
    pub async fn unregister(&self, session: SessionHandle) {
        if self.unregister_tx.send(session).await.is_err() {
            debug!(session = %session, "Hub already stopped, nothing to unregister");
        }
    }

    /// Offer a submission, waiting at most `wait` for intake capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if the intake stayed full for `wait` or the hub has
    /// stopped.
    pub async fn submit(&self, submission: ChatSubmission, wait: Duration) -> Result<(), HubError> {
        self.broadcast_tx
            .send_timeout(submission, wait)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => HubError::IntakeTimeout(wait),
                SendTimeoutError::Closed(_) => HubError::Closed,
            })
    }

    /// Offer a submission without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the intake is full or the hub has stopped.
    pub fn try_submit(&self, submission: ChatSubmission) -> Result<(), HubError> {
        self.broadcast_tx.try_send(submission).map_err(|e| match e {
            TrySendError::Full(_) => HubError::IntakeFull,
            TrySendError::Closed(_) => HubError::Closed,
        })
    }

    /// Shared hub counters.
    #[must_use]
    pub fn stats(&self) -> &HubStats {
        &self.stats
    }
}

/// The hub task state.
pub struct Hub {
    registry: SessionRegistry,
    store: Arc<dyn ChatStore>,
    config: HubConfig,
    stats: Arc<HubStats>,
    register_rx: mpsc::Receiver<RegisterRequest>,
    unregister_rx: mpsc::Receiver<SessionHandle>,
    broadcast_rx: mpsc::Receiver<ChatSubmission>,
}

impl Hub {
    /// Create a hub and the handle that feeds it.
    ///
    /// The hub does nothing until [`Hub::run`] is polled.
    #[must_use]
    pub fn new(store: Arc<dyn ChatStore>, config: HubConfig) -> (HubHandle, Self) {
        info!("Creating hub with config: {:?}", config);

        let capacity = config.intake_capacity.max(1);
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(capacity);
        let stats = Arc::new(HubStats::default());

        let handle = HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
            stats: Arc::clone(&stats),
        };
        let hub = Self {
            registry: SessionRegistry::new(),
            store,
            config,
            stats,
            register_rx,
            unregister_rx,
            broadcast_rx,
        };
        (handle, hub)
    }

    /// Create a hub and run it on a new task.
    #[must_use]
    pub fn spawn(store: Arc<dyn ChatStore>, config: HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (handle, hub) = Self::new(store, config);
        (handle, tokio::spawn(hub.run()))
    }

    /// Run the event loop until every handle has been dropped.
    ///
    /// Dropping the hub drops the registry, which closes every remaining
    /// outbound queue.
    pub async fn run(mut self) {
        info!("Hub started");

        loop {
            tokio::select! {
                Some(request) = self.register_rx.recv() => self.handle_register(request),
                Some(session) = self.unregister_rx.recv() => self.handle_unregister(session),
                Some(submission) = self.broadcast_rx.recv() => {
                    match self.handle_broadcast(submission).await {
                        Ok(report) => debug!(
                            message = %report.message_id,
                            delivered = report.delivered,
                            evicted = report.evicted,
                            skipped = report.skipped,
                            "Broadcast finished"
                        ),
                        Err(e) => {
                            self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
                            warn!(error = %e, "Broadcast abandoned");
                        }
                    }
                }
                else => break,
            }
        }

        info!(sessions = self.registry.len(), "Hub stopped");
    }

    fn handle_register(&mut self, request: RegisterRequest) {
        let RegisterRequest {
            user_id,
            outbound,
            reply,
        } = request;

        let session = match self.registry.insert(SessionEntry {
            user_id: user_id.clone(),
            outbound,
        }) {
            Ok(session) => session,
            Err(e) => {
                warn!(user = %user_id, error = %e, "Registration refused");
                let _ = reply.send(Err(e.into()));
                return;
            }
        };

        if reply.send(Ok(session)).is_err() {
            // Admission was abandoned while the request was queued.
            self.registry.remove(session);
            debug!(session = %session, user = %user_id, "Registration abandoned");
        } else {
            info!(
                session = %session,
                user = %user_id,
                sessions = self.registry.len(),
                "Session registered"
            );
        }
        self.publish_session_count();
    }

    fn handle_unregister(&mut self, session: SessionHandle) {
        match self.registry.remove(session) {
            Some(entry) => {
                info!(
                    session = %session,
                    user = %entry.user_id,
                    sessions = self.registry.len(),
                    "Session unregistered"
                );
                // Dropping the entry closes the outbound queue.
                drop(entry);
                self.publish_session_count();
            }
            None => trace!(session = %session, "Unregister for unknown session ignored"),
        }
    }

    async fn handle_broadcast(
        &mut self,
        submission: ChatSubmission,
    ) -> Result<BroadcastReport, BroadcastError> {
        let ChatSubmission {
            conversation_id,
            sender_id,
            content,
        } = submission;

        debug!(conversation = %conversation_id, sender = %sender_id, "Broadcast received");

        let message = with_deadline(
            self.config.save_timeout,
            self.store
                .save_message(&conversation_id, &sender_id, &content),
        )
        .await
        .map_err(BroadcastError::Persist)?;
        self.stats.persisted.fetch_add(1, Ordering::Relaxed);
        debug!(message = %message.id, conversation = %conversation_id, "Message saved");

        let participants = with_deadline(
            self.config.participants_timeout,
            self.store.participants(&conversation_id),
        )
        .await
        .map_err(BroadcastError::Participants)?;
        if participants.is_empty() {
            return Err(BroadcastError::NoParticipants(conversation_id));
        }
        let participants: HashSet<UserId> = participants.into_iter().collect();

        let sender_name = match with_deadline(
            self.config.display_name_timeout,
            self.store.display_name(&sender_id),
        )
        .await
        {
            Ok(name) => name,
            Err(e) => {
                warn!(user = %sender_id, error = %e, "Could not resolve sender name");
                self.config.unknown_sender.clone()
            }
        };

        let rendering = Rendering {
            sender_name: &sender_name,
            self_label: &self.config.self_label,
            now: Utc::now(),
        };

        let mut report = BroadcastReport {
            message_id: message.id.clone(),
            delivered: 0,
            evicted: 0,
            skipped: 0,
        };
        let mut saturated = Vec::new();

        for (session, entry) in self.registry.iter() {
            if !participants.contains(&entry.user_id) {
                continue;
            }

            let frame = message.view_for(&entry.user_id, &rendering);
            let payload = match codec::encode(&frame) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(session = %session, user = %entry.user_id, error = %e, "Failed to encode view");
                    report.skipped += 1;
                    continue;
                }
            };

            match entry.outbound.try_send(payload) {
                Ok(()) => {
                    report.delivered += 1;
                    trace!(session = %session, user = %entry.user_id, "Enqueued message");
                }
                Err(TrySendError::Full(_)) => {
                    warn!(session = %session, user = %entry.user_id, "Outbound queue full, evicting session");
                    saturated.push(session);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(session = %session, user = %entry.user_id, "Outbound queue closed, evicting session");
                    saturated.push(session);
                }
            }
        }

        for session in saturated {
            if self.registry.remove(session).is_some() {
                report.evicted += 1;
            }
        }

        self.stats
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.stats
            .evicted
            .fetch_add(report.evicted as u64, Ordering::Relaxed);
        self.publish_session_count();

        Ok(report)
    }

    fn publish_session_count(&self) {
        self.stats
            .sessions
            .store(self.registry.len(), Ordering::Relaxed);
    }
}
