//! Daemon configuration file
//!
//! TOML file with connection tunables; command-line flags override the file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use umbra_protocol::conn::ConnectionConfig;

/// On-disk daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// MTU offered during the handshake
    pub mtu: u16,
    /// Heartbeat interval in seconds
    pub heartbeat_secs: u16,
    /// Key-rotation interval in seconds
    pub rotation_secs: u32,
    /// Reconnect after this many unanswered heartbeats
    pub missed_heartbeat_limit: u32,
    /// Send/receive queue capacity
    pub queue_capacity: usize,
    /// Maximum reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Attempt relay→direct migration
    pub migration: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            mtu: 1380,
            heartbeat_secs: 15,
            rotation_secs: 3600,
            missed_heartbeat_limit: 3,
            queue_capacity: 1000,
            max_reconnect_attempts: 5,
            migration: true,
        }
    }
}

impl DaemonConfig {
    /// Load from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Build the connection configuration this file describes
    pub fn connection_config(&self) -> ConnectionConfig {
        let mut config = ConnectionConfig::default();
        config.handshake.mtu = self.mtu;
        config.handshake.heartbeat_interval = Duration::from_secs(self.heartbeat_secs as u64);
        config.handshake.rotation_interval = Duration::from_secs(self.rotation_secs as u64);
        config.missed_heartbeat_limit = self.missed_heartbeat_limit;
        config.queue_capacity = self.queue_capacity;
        config.backoff.max_attempts = self.max_reconnect_attempts;
        config.migration.enabled = self.migration;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_map_to_connection_config() {
        let config = DaemonConfig::default().connection_config();
        assert_eq!(config.handshake.mtu, 1380);
        assert_eq!(
            config.handshake.heartbeat_interval,
            Duration::from_secs(15)
        );
        assert_eq!(config.backoff.max_attempts, 5);
        assert!(config.migration.enabled);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: DaemonConfig = toml::from_str("mtu = 1280").unwrap();
        assert_eq!(parsed.mtu, 1280);
        assert_eq!(parsed.heartbeat_secs, 15);
    }
}
