//! Metrics collection and export for Parley.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use parley_core::{HubHandle, HubStatsSnapshot};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parley_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "parley_connections_rejected_total";
    pub const AUTH_FAILURES: &str = "parley_auth_failures_total";
    pub const SESSIONS_REGISTERED: &str = "parley_sessions_registered";
    pub const MESSAGES_PERSISTED: &str = "parley_messages_persisted_total";
    pub const FRAMES_DELIVERED: &str = "parley_frames_delivered_total";
    pub const SESSIONS_EVICTED: &str = "parley_sessions_evicted_total";
    pub const BROADCASTS_ABANDONED: &str = "parley_broadcasts_abandoned_total";
    pub const SUBMISSIONS_DROPPED: &str = "parley_submissions_dropped_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of admitted connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections refused before upgrade"
    );
    metrics::describe_counter!(names::AUTH_FAILURES, "Failed authentication attempts");
    metrics::describe_gauge!(
        names::SESSIONS_REGISTERED,
        "Sessions currently registered with the hub"
    );
    metrics::describe_counter!(names::MESSAGES_PERSISTED, "Messages saved by the hub");
    metrics::describe_counter!(
        names::FRAMES_DELIVERED,
        "Frames enqueued to recipient connections"
    );
    metrics::describe_counter!(
        names::SESSIONS_EVICTED,
        "Sessions evicted for a saturated outbound queue"
    );
    metrics::describe_counter!(
        names::BROADCASTS_ABANDONED,
        "Broadcasts abandoned before fan-out"
    );
    metrics::describe_counter!(
        names::SUBMISSIONS_DROPPED,
        "Submissions dropped at the hub intake"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a connection refused before upgrade.
pub fn record_rejected(reason: &'static str) {
    counter!(names::CONNECTIONS_REJECTED, "reason" => reason).increment(1);
}

/// Record a failed authentication.
pub fn record_auth_failure(reason: &'static str) {
    counter!(names::AUTH_FAILURES, "reason" => reason).increment(1);
}

/// Mirror a hub statistics snapshot.
pub fn record_hub_stats(stats: &HubStatsSnapshot) {
    gauge!(names::SESSIONS_REGISTERED).set(stats.sessions as f64);
    counter!(names::MESSAGES_PERSISTED).absolute(stats.persisted);
    counter!(names::FRAMES_DELIVERED).absolute(stats.delivered);
    counter!(names::SESSIONS_EVICTED).absolute(stats.evicted);
    counter!(names::BROADCASTS_ABANDONED).absolute(stats.abandoned);
    counter!(names::SUBMISSIONS_DROPPED).absolute(stats.dropped);
}

/// Periodically mirror hub statistics into metrics.
pub fn spawn_stats_exporter(hub: HubHandle, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            record_hub_stats(&hub.stats().snapshot());
        }
    })
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
