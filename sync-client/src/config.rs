//! Configuration loading for a sync engine.
//!
//! Configuration is loaded from a TOML file (default: `hearth.toml`). Every
//! section and field is optional; missing values fall back to the defaults
//! below.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sync_core::{ReconnectPolicy, RetryPolicy};

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local device settings.
    pub device: DeviceConfig,
    /// Peer sync settings.
    pub sync: SyncConfig,
    /// Local-network discovery settings.
    pub discovery: DiscoveryConfig,
    /// Process shutdown settings.
    pub shutdown: ShutdownConfig,
}

/// Local device settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Name used when the device identity is first created.
    #[serde(default = "default_device_name")]
    pub name: String,
    /// Directory holding the SQLite store (default: platform data dir).
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

/// Peer sync settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Port peers dial to reach this device (default: 47800, 0 = any).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Window collapsing status events (default: 500ms).
    #[serde(default = "default_status_throttle_ms")]
    pub status_throttle_ms: u64,
    /// Silence after which a connected peer is evicted (default: 60s).
    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,
    /// Time allowed for a new link to send `Hello` (default: 10s).
    #[serde(default = "default_hello_timeout_secs")]
    pub hello_timeout_secs: u64,
    /// Reconnect attempts before a lost peer is evicted (default: 5).
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// First reconnect delay (default: 1000ms), doubled per attempt.
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    /// Longest reconnect delay before jitter (default: 30s).
    #[serde(default = "default_reconnect_cap_secs")]
    pub reconnect_cap_secs: u64,
    /// Random jitter added to each reconnect delay (default: 5000ms).
    #[serde(default = "default_reconnect_jitter_ms")]
    pub reconnect_jitter_ms: u64,
    /// Unacknowledged updates kept per peer before a full resync (default: 1024).
    #[serde(default = "default_update_buffer_capacity")]
    pub update_buffer_capacity: usize,
    /// Interval between document snapshot flushes (default: 2000ms).
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Delay between initialization attempts while no family exists (default: 2000ms).
    #[serde(default = "default_init_retry_ms")]
    pub init_retry_ms: u64,
    /// Initialization attempts before giving up (default: 30).
    #[serde(default = "default_init_max_attempts")]
    pub init_max_attempts: u32,
}

/// Local-network discovery settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Enable discovery (default: true).
    #[serde(default = "default_discovery_enabled")]
    pub enabled: bool,
    /// UDP port for beacons (default: 47801).
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    /// Interval between announcements (default: 5s).
    #[serde(default = "default_announce_interval_secs")]
    pub announce_interval_secs: u64,
    /// Lifetime of a discovered entry without refresh (default: 30s).
    #[serde(default = "default_discovery_ttl_secs")]
    pub ttl_secs: u64,
    /// How long join requests, replies and answers are remembered (default: 600s).
    #[serde(default = "default_join_ttl_secs")]
    pub join_ttl_secs: u64,
}

/// Process shutdown settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Overall budget for an orderly shutdown (default: 5s).
    #[serde(default = "default_shutdown_timeout_secs")]
    pub timeout_secs: u64,
}

// Default value functions
fn default_device_name() -> String {
    "Hearth device".to_string()
}

fn default_listen_port() -> u16 {
    47800
}

fn default_status_throttle_ms() -> u64 {
    500
}

fn default_peer_timeout_secs() -> u64 {
    60
}

fn default_hello_timeout_secs() -> u64 {
    10
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_ms() -> u64 {
    1000
}

fn default_reconnect_cap_secs() -> u64 {
    30
}

fn default_reconnect_jitter_ms() -> u64 {
    5000
}

fn default_update_buffer_capacity() -> usize {
    1024
}

fn default_flush_interval_ms() -> u64 {
    2000
}

fn default_init_retry_ms() -> u64 {
    2000
}

fn default_init_max_attempts() -> u32 {
    30
}

fn default_discovery_enabled() -> bool {
    true
}

fn default_discovery_port() -> u16 {
    47801
}

fn default_announce_interval_secs() -> u64 {
    5
}

fn default_discovery_ttl_secs() -> u64 {
    30
}

fn default_join_ttl_secs() -> u64 {
    600
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            data_dir: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            status_throttle_ms: default_status_throttle_ms(),
            peer_timeout_secs: default_peer_timeout_secs(),
            hello_timeout_secs: default_hello_timeout_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_cap_secs: default_reconnect_cap_secs(),
            reconnect_jitter_ms: default_reconnect_jitter_ms(),
            update_buffer_capacity: default_update_buffer_capacity(),
            flush_interval_ms: default_flush_interval_ms(),
            init_retry_ms: default_init_retry_ms(),
            init_max_attempts: default_init_max_attempts(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: default_discovery_enabled(),
            port: default_discovery_port(),
            announce_interval_secs: default_announce_interval_secs(),
            ttl_secs: default_discovery_ttl_secs(),
            join_ttl_secs: default_join_ttl_secs(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl SyncConfig {
    /// Reconnect schedule for lost peers.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            base: Duration::from_millis(self.reconnect_base_ms),
            cap: Duration::from_secs(self.reconnect_cap_secs),
            max_jitter: Duration::from_millis(self.reconnect_jitter_ms),
        }
    }

    /// Retry schedule for initialization before a family exists.
    pub fn init_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            Duration::from_millis(self.init_retry_ms),
            self.init_max_attempts,
        )
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
