//! # Configuration Management Module
//!
//! Loads, validates and writes the node configuration.
//!
//! ## Configuration Structure
//!
//! - [`NodeConfig`] - this node's id and starting position
//! - [`TransportConfig`] - serial device and baud rate
//! - [`MeshConfig`] - loop pacing, duplicate window and staleness
//! - [`PersistConfig`] - where the JSON snapshot is written
//! - [`ViewerConfig`] - WebSocket endpoint for live viewers
//! - [`LoggingConfig`] - log level and optional log file
//! - [`LockConfig`] - single-instance lock file
//!
//! ## Configuration File Format
//!
//! ```toml
//! [node]
//! id = "001"
//! x = 55.755864
//! y = 37.617698
//!
//! [transport]
//! port = "/dev/ttyS5"
//! baud_rate = 115200
//!
//! [mesh]
//! send_interval_ms = 1000
//! stale_after_secs = 300
//! ```
//!
//! Every section is optional and falls back to defaults. CLI arguments override the
//! file: CLI args > Config file > Defaults.
//!
//! ## Node ids
//!
//! Frames have no escaping, so [`validate_node_id`] rejects ids that contain a frame
//! marker (`S`, `E`), the field separator (`;`), control characters or non-ASCII text.

use crate::mesh::{MeshTiming, SelfState};
use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;

pub const MAX_NODE_ID_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeIdError {
    #[error("node id is empty")]
    Empty,

    #[error("node id is too long (maximum {max} bytes)")]
    TooLong { max: usize },

    #[error("node id contains reserved character {0:?} (frame markers S/E and ';' are not allowed)")]
    Reserved(char),

    #[error("node id contains non-printable or non-ASCII character {0:?}")]
    NotPrintable(char),
}

/// Check that an id can be framed without corrupting the wire format.
pub fn validate_node_id(id: &str) -> Result<(), NodeIdError> {
    if id.is_empty() {
        return Err(NodeIdError::Empty);
    }
    if id.len() > MAX_NODE_ID_LEN {
        return Err(NodeIdError::TooLong {
            max: MAX_NODE_ID_LEN,
        });
    }
    for ch in id.chars() {
        match ch {
            'S' | 'E' | ';' => return Err(NodeIdError::Reserved(ch)),
            c if !c.is_ascii() || c.is_ascii_control() => {
                return Err(NodeIdError::NotPrintable(c))
            }
            _ => {}
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub transport: TransportConfig,
    pub mesh: MeshConfig,
    pub persist: PersistConfig,
    pub viewer: ViewerConfig,
    pub logging: LoggingConfig,
    pub lock: LockConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: String,
    pub x: f64,
    pub y: f64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "001".to_string(),
            x: 55.755864,
            y: 37.617698,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub port: String,
    pub baud_rate: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyS5".to_string(),
            baud_rate: 115200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub send_interval_ms: u64,
    /// Extra pause after each send (ms)
    pub send_settle_ms: u64,
    /// Wait after a transport error before retrying (ms)
    pub error_cooldown_ms: u64,
    /// Wait between polls when no bytes are available (ms)
    pub idle_poll_ms: u64,
    pub report_interval_secs: u64,
    /// How long an identical frame is treated as a duplicate
    pub dedup_window_secs: u64,
    pub dedup_capacity: usize,
    /// Evict neighbors silent for this long; 0 disables eviction
    pub stale_after_secs: u64,
    /// Receive buffer bound while waiting for an end marker
    pub max_buffer_bytes: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            send_interval_ms: 1000,
            send_settle_ms: 10,
            error_cooldown_ms: 1000,
            idle_poll_ms: 100,
            report_interval_secs: 10,
            dedup_window_secs: 30,
            dedup_capacity: 4096,
            stale_after_secs: 300,
            max_buffer_bytes: 4096,
        }
    }
}

impl MeshConfig {
    pub fn timing(&self) -> MeshTiming {
        MeshTiming {
            send_interval: Duration::from_millis(self.send_interval_ms),
            send_settle: Duration::from_millis(self.send_settle_ms),
            error_cooldown: Duration::from_millis(self.error_cooldown_ms),
            idle_poll: Duration::from_millis(self.idle_poll_ms),
            report_interval: Duration::from_secs(self.report_interval_secs),
            stale_after: (self.stale_after_secs > 0)
                .then(|| Duration::from_secs(self.stale_after_secs)),
            dedup_window: Duration::from_secs(self.dedup_window_secs),
            dedup_capacity: self.dedup_capacity,
            max_buffer_bytes: self.max_buffer_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "drone_data.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:5000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub path: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            path: "/tmp/meshtrack.lock".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            transport: TransportConfig::default(),
            mesh: MeshConfig::default(),
            persist: PersistConfig::default(),
            viewer: ViewerConfig::default(),
            logging: LoggingConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        Self::from_toml(&content).map_err(|e| anyhow!("Invalid config file {}: {}", path, e))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let content = toml::to_string_pretty(&Config::default())
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        validate_node_id(&self.node.id).map_err(|e| anyhow!("[node] id: {}", e))?;
        if !self.node.x.is_finite() || !self.node.y.is_finite() {
            bail!("[node] x and y must be finite numbers");
        }
        if self.transport.port.trim().is_empty() {
            bail!("[transport] port must not be empty");
        }
        if self.transport.baud_rate == 0 {
            bail!("[transport] baud_rate must be positive");
        }
        let mesh = &self.mesh;
        for (name, value) in [
            ("send_interval_ms", mesh.send_interval_ms),
            ("error_cooldown_ms", mesh.error_cooldown_ms),
            ("idle_poll_ms", mesh.idle_poll_ms),
            ("report_interval_secs", mesh.report_interval_secs),
            ("dedup_window_secs", mesh.dedup_window_secs),
        ] {
            if value == 0 {
                bail!("[mesh] {} must be positive", name);
            }
        }
        if mesh.dedup_capacity == 0 || mesh.max_buffer_bytes == 0 {
            bail!("[mesh] dedup_capacity and max_buffer_bytes must be positive");
        }
        if self.persist.enabled && self.persist.path.trim().is_empty() {
            bail!("[persist] path must not be empty when persistence is enabled");
        }
        Ok(())
    }

    pub fn self_state(&self) -> SelfState {
        SelfState::new(self.node.id.clone(), self.node.x, self.node.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_and_round_trips() {
        let config = Config::default();
        config.validate().unwrap();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = Config::from_toml(&text).unwrap();
        assert_eq!(parsed.node.id, "001");
        assert_eq!(parsed.transport.baud_rate, 115200);
        assert_eq!(parsed.mesh.send_interval_ms, 1000);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config = Config::from_toml(
            r#"
            [node]
            id = "042"
            x = 1.5
            y = -2.5

            [mesh]
            stale_after_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.self_state(), SelfState::new("042", 1.5, -2.5));
        assert_eq!(config.mesh.idle_poll_ms, 100);
        assert_eq!(config.mesh.timing().stale_after, None);
        assert_eq!(config.persist.path, "drone_data.json");
    }

    #[test]
    fn timing_converts_units() {
        let timing = MeshConfig::default().timing();
        assert_eq!(timing.send_interval, Duration::from_secs(1));
        assert_eq!(timing.send_settle, Duration::from_millis(10));
        assert_eq!(timing.stale_after, Some(Duration::from_secs(300)));
        assert_eq!(timing.dedup_window, Duration::from_secs(30));
    }

    #[test]
    fn node_id_rules() {
        assert_eq!(validate_node_id("001"), Ok(()));
        assert_eq!(validate_node_id("drone-7a"), Ok(()));
        assert_eq!(validate_node_id(""), Err(NodeIdError::Empty));
        assert_eq!(validate_node_id("SKY1"), Err(NodeIdError::Reserved('S')));
        assert_eq!(validate_node_id("nodeE"), Err(NodeIdError::Reserved('E')));
        assert_eq!(validate_node_id("a;b"), Err(NodeIdError::Reserved(';')));
        assert_eq!(
            validate_node_id("dr\u{f6}ne"),
            Err(NodeIdError::NotPrintable('\u{f6}'))
        );
        assert_eq!(
            validate_node_id(&"x".repeat(MAX_NODE_ID_LEN + 1)),
            Err(NodeIdError::TooLong {
                max: MAX_NODE_ID_LEN
            })
        );
    }

    #[test]
    fn invalid_node_id_rejects_config() {
        let err = Config::from_toml("[node]\nid = \"S1\"\nx = 0.0\ny = 0.0\n").unwrap_err();
        assert!(err.to_string().contains("node"));
    }

    #[test]
    fn zero_interval_rejected() {
        let mut config = Config::default();
        config.mesh.send_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn create_default_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();
        tokio_test::block_on(async {
            Config::create_default(path).await.unwrap();
            let loaded = Config::load(path).await.unwrap();
            assert_eq!(loaded.viewer.bind, "0.0.0.0:5000");
            assert_eq!(loaded.lock.path, "/tmp/meshtrack.lock");
            assert!(Config::load("/nonexistent/meshtrack.toml").await.is_err());
        });
    }
}
