//! Server configuration.
//!
//! Configuration is layered, lowest precedence first:
//! - Built-in defaults (`PARLEY_HOST` / `PARLEY_PORT` seed the bind address)
//! - TOML configuration file
//! - Environment variables (`PARLEY__SECTION__KEY`)

use anyhow::{bail, Context, Result};
use parley_core::{ConnectionConfig, HubConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Hub configuration.
    #[serde(default)]
    pub hub: HubSection,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Users and conversations loaded into the in-memory store at startup.
    #[serde(default)]
    pub seed: SeedConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of live connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Outbound queue capacity per connection.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Default page size for history reads.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Largest page size a client may ask for.
    #[serde(default = "default_max_history_limit")]
    pub max_history_limit: usize,

    /// Recent messages included per conversation in the chat overview.
    #[serde(default = "default_overview_messages")]
    pub overview_messages: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    #[serde(default = "default_ping_period")]
    pub ping_period_ms: u64,

    /// How long a peer may go without a pong, in milliseconds.
    #[serde(default = "default_pong_wait")]
    pub pong_wait_ms: u64,

    /// Deadline for a single write, in milliseconds.
    #[serde(default = "default_write_wait")]
    pub write_wait_ms: u64,
}

/// Hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    /// Capacity of each hub intake channel.
    #[serde(default = "default_intake_capacity")]
    pub intake_capacity: usize,

    /// How long a websocket submission waits for intake capacity.
    #[serde(default = "default_submit_wait")]
    pub submit_wait_ms: u64,

    /// Deadline for persisting a message.
    #[serde(default = "default_save_timeout")]
    pub save_timeout_ms: u64,

    /// Deadline for resolving participants.
    #[serde(default = "default_lookup_timeout")]
    pub participants_timeout_ms: u64,

    /// Deadline for resolving the sender's display name.
    #[serde(default = "default_lookup_timeout")]
    pub display_name_timeout_ms: u64,
}

/// Authentication configuration.
///
/// With `jwt_secret` set, bearer tokens are HS256 JWTs whose `sub` claim is
/// the user id. Otherwise tokens are looked up in `tokens`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for JWT verification.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Static token table, token to user id.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// How often hub statistics are mirrored into metrics, in milliseconds.
    #[serde(default = "default_export_interval")]
    pub export_interval_ms: u64,
}

/// Store seed data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedConfig {
    /// Known users.
    #[serde(default)]
    pub users: Vec<SeedUser>,

    /// Conversations between known users.
    #[serde(default)]
    pub conversations: Vec<SeedConversation>,
}

/// A seeded user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedUser {
    /// User id.
    pub id: String,
    /// Display name shown to other participants.
    pub name: String,
}

/// A seeded conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedConversation {
    /// Conversation id.
    pub id: String,
    /// Participant user ids.
    pub participants: Vec<String>,
}

// Default value functions
fn default_host() -> String {
    std::env::var("PARLEY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("PARLEY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_frame_size() -> usize {
    parley_protocol::codec::MAX_FRAME_SIZE
}

fn default_max_connections() -> usize {
    10_000
}

fn default_outbound_queue() -> usize {
    256
}

fn default_history_limit() -> usize {
    50
}

fn default_max_history_limit() -> usize {
    500
}

fn default_overview_messages() -> usize {
    20
}

fn default_ping_period() -> u64 {
    54_000 // 9/10 of the pong wait
}

fn default_pong_wait() -> u64 {
    60_000
}

fn default_write_wait() -> u64 {
    10_000
}

fn default_intake_capacity() -> usize {
    256
}

fn default_submit_wait() -> u64 {
    2_000
}

fn default_save_timeout() -> u64 {
    5_000
}

fn default_lookup_timeout() -> u64 {
    3_000
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_export_interval() -> u64 {
    5_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            hub: HubSection::default(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
            seed: SeedConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            outbound_queue: default_outbound_queue(),
            history_limit: default_history_limit(),
            max_history_limit: default_max_history_limit(),
            overview_messages: default_overview_messages(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_period_ms: default_ping_period(),
            pong_wait_ms: default_pong_wait(),
            write_wait_ms: default_write_wait(),
        }
    }
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            intake_capacity: default_intake_capacity(),
            submit_wait_ms: default_submit_wait(),
            save_timeout_ms: default_save_timeout(),
            participants_timeout_ms: default_lookup_timeout(),
            display_name_timeout_ms: default_lookup_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            export_interval_ms: default_export_interval(),
        }
    }
}

impl Config {
    /// Load configuration from file, environment, or defaults.
    ///
    /// The file is `$PARLEY_CONFIG` if set, otherwise the first of the
    /// default paths that exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a config source cannot be parsed or the result
    /// fails validation.
    pub fn load() -> Result<Self> {
        let file = match std::env::var("PARLEY_CONFIG") {
            Ok(path) => Some(PathBuf::from(shellexpand::tilde(&path).as_ref())),
            Err(_) => Self::default_file(),
        };
        Self::from_sources(file.as_deref())
    }

    fn default_file() -> Option<PathBuf> {
        let config_paths = [
            "parley.toml",
            "/etc/parley/parley.toml",
            "~/.config/parley/parley.toml",
        ];

        config_paths
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Build configuration from an optional TOML file plus `PARLEY__*`
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or the result
    /// fails validation.
    pub fn from_sources(file: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("PARLEY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration sources")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("heartbeat.ping_period_ms", self.heartbeat.ping_period_ms),
            ("heartbeat.pong_wait_ms", self.heartbeat.pong_wait_ms),
            ("heartbeat.write_wait_ms", self.heartbeat.write_wait_ms),
        ] {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        if self.heartbeat.ping_period_ms >= self.heartbeat.pong_wait_ms {
            bail!(
                "heartbeat.ping_period_ms ({}) must be shorter than heartbeat.pong_wait_ms ({})",
                self.heartbeat.ping_period_ms,
                self.heartbeat.pong_wait_ms
            );
        }
        if self.limits.outbound_queue == 0 {
            bail!("limits.outbound_queue must be greater than zero");
        }
        if self.hub.intake_capacity == 0 {
            bail!("hub.intake_capacity must be greater than zero");
        }
        if self.transport.max_frame_size == 0 {
            bail!("transport.max_frame_size must be greater than zero");
        }
        if !self.transport.websocket_path.starts_with('/') {
            bail!(
                "transport.websocket_path must start with '/': {}",
                self.transport.websocket_path
            );
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Per-connection settings derived from this configuration.
    #[must_use]
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_frame_size: self.transport.max_frame_size,
            pong_wait: Duration::from_millis(self.heartbeat.pong_wait_ms),
            ping_period: Duration::from_millis(self.heartbeat.ping_period_ms),
            write_wait: Duration::from_millis(self.heartbeat.write_wait_ms),
            submit_wait: Duration::from_millis(self.hub.submit_wait_ms),
            outbound_capacity: self.limits.outbound_queue,
        }
    }

    /// Hub settings derived from this configuration.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            intake_capacity: self.hub.intake_capacity,
            save_timeout: Duration::from_millis(self.hub.save_timeout_ms),
            participants_timeout: Duration::from_millis(self.hub.participants_timeout_ms),
            display_name_timeout: Duration::from_millis(self.hub.display_name_timeout_ms),
            ..HubConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.transport.max_frame_size, 4096);
        assert_eq!(config.limits.history_limit, 50);
        assert!(config.auth.jwt_secret.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn test_invalid_bind_addr() {
        let config = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_connections = 500

            [auth.tokens]
            alice-token = "u1"

            [[seed.users]]
            id = "u1"
            name = "Alice"

            [[seed.conversations]]
            id = "c1"
            participants = ["u1", "u2"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 500);
        assert_eq!(config.limits.outbound_queue, 256);
        assert_eq!(config.auth.tokens.get("alice-token").map(String::as_str), Some("u1"));
        assert_eq!(config.seed.users[0].name, "Alice");
        assert_eq!(config.seed.conversations[0].participants, ["u1", "u2"]);
    }

    #[test]
    fn test_from_toml_file() {
        let path = std::env::temp_dir().join(format!("parley-{}.toml", std::process::id()));
        std::fs::write(&path, "port = 9100\n[heartbeat]\nping_period_ms = 1000\npong_wait_ms = 2000\n")
            .unwrap();

        let config = Config::from_sources(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 9100);
        assert_eq!(config.connection_config().ping_period, Duration::from_secs(1));
    }

    #[test]
    fn test_rejects_ping_period_not_shorter_than_pong_wait() {
        let mut config = Config::default();
        config.heartbeat.ping_period_ms = 60_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_capacities() {
        let mut config = Config::default();
        config.limits.outbound_queue = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.hub.intake_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_heartbeat_timings() {
        let mut config = Config::default();
        config.heartbeat.ping_period_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("heartbeat.ping_period_ms"));

        let mut config = Config::default();
        config.heartbeat.pong_wait_ms = 0;
        config.heartbeat.ping_period_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.heartbeat.write_wait_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("heartbeat.write_wait_ms"));
    }

    #[test]
    fn test_rejects_zero_ping_period_from_toml() {
        let config: Config = toml::from_str(
            r#"
            [heartbeat]
            ping_period_ms = 0
            pong_wait_ms = 1000
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_core_configs() {
        let config = Config::default();

        let connection = config.connection_config();
        assert_eq!(connection.pong_wait, Duration::from_secs(60));
        assert_eq!(connection.ping_period, Duration::from_secs(54));
        assert_eq!(connection.write_wait, Duration::from_secs(10));
        assert_eq!(connection.submit_wait, Duration::from_secs(2));

        let hub = config.hub_config();
        assert_eq!(hub.save_timeout, Duration::from_secs(5));
        assert_eq!(hub.participants_timeout, Duration::from_secs(3));
        assert_eq!(hub.self_label, "You");
    }
}
