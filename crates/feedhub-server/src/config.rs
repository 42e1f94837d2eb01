//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (FEEDHUB_HOST, FEEDHUB_PORT)
//! - TOML configuration file

use anyhow::{ensure, Context, Result};
use feedhub_core::{FeedId, HubConfig, UserId, MIN_KEEPALIVE_INTERVAL};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
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

    /// Hub timing and queue settings.
    #[serde(default)]
    pub hub: HubSettings,

    /// Feed-counter WebSocket settings.
    #[serde(default)]
    pub websocket: WebSocketConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Known users and their API keys.
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

/// Hub settings, mapped onto [`HubConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    /// Write deadline in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Keepalive interval in milliseconds.
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_ms: u64,

    /// Delivery timeout in milliseconds.
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_ms: u64,

    /// Broadcast trigger queue capacity.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    /// Per-connection outbound queue capacity.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Number of newest feeds considered for the unread count.
    #[serde(default = "default_feed_window")]
    pub feed_window: usize,
}

/// Counter payload format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RendererKind {
    /// htmx out-of-band badge fragment.
    Html,
    /// `{"type":"feed_counter","count":N}`.
    Json,
}

/// WebSocket configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Path of the feed-counter endpoint.
    #[serde(default = "default_ws_path")]
    pub path: String,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Payload format.
    #[serde(default = "default_renderer")]
    pub renderer: RendererKind,

    /// Element id targeted by the HTML badge.
    #[serde(default = "default_element_id")]
    pub element_id: String,
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

    /// How often hub statistics are exported, in milliseconds.
    #[serde(default = "default_stats_interval")]
    pub stats_interval_ms: u64,
}

/// A user allowed to open a feed-counter connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    /// API key sent in `X-Api-Key` or the `feedhub-api-key` cookie.
    pub api_key: String,

    /// User id.
    pub user_id: UserId,

    /// Display name.
    #[serde(default)]
    pub name: String,

    /// Id of the last feed the user has seen.
    #[serde(default)]
    pub last_feed: FeedId,
}

// Default value functions
fn default_host() -> String {
    std::env::var("FEEDHUB_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("FEEDHUB_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_write_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_keepalive_interval() -> u64 {
    300_000 // 5 minutes
}

fn default_delivery_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_broadcast_capacity() -> usize {
    100
}

fn default_outbound_capacity() -> usize {
    256
}

fn default_feed_window() -> usize {
    100
}

fn default_ws_path() -> String {
    "/ws/feed-counter".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_renderer() -> RendererKind {
    RendererKind::Html
}

fn default_element_id() -> String {
    feedhub_protocol::render::DEFAULT_ELEMENT_ID.to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_stats_interval() -> u64 {
    15_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            hub: HubSettings::default(),
            websocket: WebSocketConfig::default(),
            metrics: MetricsConfig::default(),
            users: Vec::new(),
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            write_timeout_ms: default_write_timeout(),
            keepalive_interval_ms: default_keepalive_interval(),
            delivery_timeout_ms: default_delivery_timeout(),
            broadcast_capacity: default_broadcast_capacity(),
            outbound_capacity: default_outbound_capacity(),
            feed_window: default_feed_window(),
        }
    }
}

impl HubSettings {
    /// Reject settings the hub cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero write timeout or a keepalive interval
    /// below [`MIN_KEEPALIVE_INTERVAL`].
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.write_timeout_ms > 0,
            "hub.write_timeout_ms must be greater than zero"
        );
        ensure!(
            u128::from(self.keepalive_interval_ms) >= MIN_KEEPALIVE_INTERVAL.as_millis(),
            "hub.keepalive_interval_ms must be at least {}",
            MIN_KEEPALIVE_INTERVAL.as_millis()
        );
        Ok(())
    }

    /// Convert into the hub's own configuration.
    #[must_use]
    pub fn to_hub_config(&self) -> HubConfig {
        HubConfig {
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            keepalive_interval: Duration::from_millis(self.keepalive_interval_ms),
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            broadcast_capacity: self.broadcast_capacity,
            outbound_capacity: self.outbound_capacity,
            feed_window: self.feed_window,
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: default_ws_path(),
            max_message_size: default_max_message_size(),
            renderer: default_renderer(),
            element_id: default_element_id(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            stats_interval_ms: default_stats_interval(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "feedhub.toml",
            "/etc/feedhub/feedhub.toml",
            "~/.config/feedhub/feedhub.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .hub
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
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
}
