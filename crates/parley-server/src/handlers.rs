//! HTTP and WebSocket handlers for the Parley server.
//!
//! This module wires the hub to the outside world: websocket admission,
//! the chat overview, history reads, REST submission and health.

use crate::auth::{self, Authenticated, Authenticator};
use crate::config::{Config, SeedConfig};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocket, Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use parley_core::store::with_deadline;
use parley_core::{
    chat_overview, ChatOverview, ChatStore, ChatSubmission, Connection, ConnectionConfig, Hub,
    HubError, HubHandle, Identity, MemoryStore, StoreError, StoredMessage,
};
use parley_transport::websocket;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use std::future::IntoFuture;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Intake handle of the running hub.
    pub hub: HubHandle,
    /// The persistence and lookup collaborator.
    pub store: Arc<dyn ChatStore>,
    /// Verifies bearer tokens.
    pub authenticator: Arc<dyn Authenticator>,
    /// Server configuration.
    pub config: Config,
    connection_config: ConnectionConfig,
    lookup_timeout: Duration,
    connections: AtomicUsize,
}

impl AppState {
    /// Seed the store, start the hub and build the authenticator.
    ///
    /// Returns the state together with the hub task, which the caller
    /// supervises. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the seed data is inconsistent.
    pub fn new(config: Config) -> Result<(Self, JoinHandle<()>)> {
        let store: Arc<dyn ChatStore> = Arc::new(seed_store(&config.seed)?);
        let (hub, task) = Hub::spawn(store.clone(), config.hub_config());

        let state = Self {
            hub,
            store,
            authenticator: auth::from_config(&config.auth),
            connection_config: config.connection_config(),
            lookup_timeout: Duration::from_millis(config.hub.participants_timeout_ms),
            connections: AtomicUsize::new(0),
            config,
        };
        Ok((state, task))
    }

    /// Number of live websocket connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

fn seed_store(seed: &SeedConfig) -> Result<MemoryStore> {
    let store = MemoryStore::new();

    for user in &seed.users {
        store.add_user(user.id.clone(), user.name.clone());
    }

    for conversation in &seed.conversations {
        for participant in &conversation.participants {
            if !seed.users.iter().any(|u| &u.id == participant) {
                warn!(
                    conversation = %conversation.id,
                    user = %participant,
                    "Seeded conversation names an unknown user"
                );
            }
        }
        store
            .create_conversation(conversation.id.clone(), conversation.participants.iter().cloned())
            .with_context(|| format!("Invalid seeded conversation {}", conversation.id))?;
    }

    info!(
        users = seed.users.len(),
        conversations = seed.conversations.len(),
        "Store seeded"
    );
    Ok(store)
}

/// A reserved slot under `limits.max_connections`, released on drop.
struct ConnectionSlot {
    state: Arc<AppState>,
}

impl ConnectionSlot {
    fn acquire(state: &Arc<AppState>) -> Option<Self> {
        let max = state.config.limits.max_connections;
        state
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| Self {
                state: state.clone(),
            })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Errors returned by the REST handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Request is missing a required field.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// Caller is not a participant of the conversation.
    #[error("not a participant of conversation {0}")]
    NotParticipant(String),

    /// Hub could not take the submission.
    #[error(transparent)]
    Hub(#[from] HubError),

    /// Store call failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::MissingField(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            ApiError::NotParticipant(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            ApiError::Hub(_) => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE"),
            ApiError::Store(StoreError::ConversationNotFound(_)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            ApiError::Store(StoreError::Timeout(_)) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            ApiError::Store(e) => {
                error!(error = %e, "Store failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };

        let body = serde_json::json!({
            "error": code,
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/chat/conversations", get(conversations_handler))
        .route("/chat/messages/:conversation_id", get(history_handler))
        .route("/chat/message", post(post_message_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let (state, hub_task) = AppState::new(config.clone())?;
    let state = Arc::new(state);

    // Start metrics server if enabled
    if config.metrics.enabled {
        match metrics::start_metrics_server(config.metrics.port) {
            Ok(()) => {
                metrics::spawn_stats_exporter(
                    state.hub.clone(),
                    Duration::from_millis(config.metrics.export_interval_ms),
                );
            }
            Err(e) => error!("Failed to start metrics server: {}", e),
        }
    }

    let app = router(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    tokio::select! {
        result = server.into_future() => result?,
        e = hub_exit(hub_task) => return Err(e),
    }

    info!("Parley server stopped");
    Ok(())
}

/// Wait for the hub task to end and log how it ended.
///
/// The server holds a hub handle for as long as it serves, so any exit
/// while serving is fatal.
async fn hub_exit(task: JoinHandle<()>) -> anyhow::Error {
    match task.await {
        Ok(()) => {
            error!("Hub task stopped while the server was running");
            anyhow::anyhow!("hub stopped")
        }
        Err(e) if e.is_panic() => {
            error!(error = %e, "Hub task panicked");
            anyhow::anyhow!("hub panicked: {e}")
        }
        Err(e) => {
            error!(error = %e, "Hub task was cancelled");
            anyhow::anyhow!("hub cancelled: {e}")
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.connection_count(),
        "hub": state.hub.stats().snapshot(),
    }))
}

/// WebSocket upgrade handler. Authentication has already succeeded when this
/// runs; a rejected caller never reaches the hub.
async fn ws_handler(
    Authenticated(identity): Authenticated,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(slot) = ConnectionSlot::acquire(&state) else {
        warn!(user = %identity.user_id(), "Connection limit reached");
        metrics::record_rejected("limit");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };

    let limit = state.config.transport.max_frame_size;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_websocket(socket, state, identity, slot))
}

/// Drive one admitted websocket until both halves stop.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    identity: Identity,
    _slot: ConnectionSlot,
) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (reader, writer) = websocket::split(socket);
    let connection = match Connection::admit(
        state.hub.clone(),
        identity,
        reader,
        writer,
        state.connection_config.clone(),
    )
    .await
    {
        Ok(connection) => connection,
        Err(e) => {
            error!(error = %e, "Failed to admit connection");
            return;
        }
    };

    let session = connection.session();
    let user = connection.user_id().to_string();
    debug!(session = %session, user = %user, "WebSocket connected");

    match connection.join().await {
        Ok((read, write)) => {
            debug!(session = %session, user = %user, read = ?read, write = ?write, "WebSocket disconnected");
        }
        Err(e) => error!(session = %session, user = %user, error = %e, "Connection task failed"),
    }
}

/// Conversation list and recent messages of the caller.
async fn conversations_handler(
    Authenticated(identity): Authenticated,
    State(state): State<Arc<AppState>>,
) -> Result<Json<ChatOverview>, ApiError> {
    let overview = with_deadline(
        state.lookup_timeout,
        chat_overview(
            state.store.as_ref(),
            identity.user_id(),
            state.config.limits.overview_messages,
            Utc::now(),
        ),
    )
    .await?;

    debug!(
        user = %identity.user_id(),
        conversations = overview.conversations.len(),
        "Overview read"
    );
    Ok(Json(overview))
}

/// History query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    /// Page size.
    pub limit: Option<usize>,
    /// Number of newest messages to skip.
    pub offset: Option<usize>,
}

/// Stored messages of a conversation, oldest first. Participants only.
async fn history_handler(
    Authenticated(identity): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<StoredMessage>>, ApiError> {
    let participants =
        with_deadline(state.lookup_timeout, state.store.participants(&conversation_id)).await?;
    if !participants.iter().any(|p| p == identity.user_id()) {
        return Err(ApiError::NotParticipant(conversation_id));
    }

    let limit = query
        .limit
        .unwrap_or(state.config.limits.history_limit)
        .min(state.config.limits.max_history_limit);
    let offset = query.offset.unwrap_or(0);

    let messages = with_deadline(
        state.lookup_timeout,
        state.store.history(&conversation_id, limit, offset),
    )
    .await?;

    debug!(
        user = %identity.user_id(),
        conversation = %conversation_id,
        count = messages.len(),
        "History read"
    );
    Ok(Json(messages))
}

/// REST submission body.
#[derive(Debug, Default, Deserialize)]
pub struct PostMessage {
    /// Target conversation.
    #[serde(alias = "conversationId", default)]
    pub conversation_id: String,
    /// Message body.
    #[serde(default)]
    pub content: String,
}

/// Stamp the caller as sender and hand the submission to the hub without
/// waiting for intake capacity.
async fn post_message_handler(
    Authenticated(identity): Authenticated,
    State(state): State<Arc<AppState>>,
    Json(body): Json<PostMessage>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if body.conversation_id.is_empty() {
        return Err(ApiError::MissingField("conversation_id"));
    }
    if body.content.is_empty() {
        return Err(ApiError::MissingField("content"));
    }

    let submission = ChatSubmission::new(body.conversation_id, identity.user_id(), body.content);
    if let Err(e) = state.hub.try_submit(submission) {
        state.hub.stats().record_dropped();
        warn!(user = %identity.user_id(), error = %e, "REST submission rejected");
        return Err(e.into());
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "accepted" })),
    ))
}
