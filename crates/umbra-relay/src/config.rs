//! Relay broker configuration

use serde::{Deserialize, Serialize};

/// Broker configuration, loadable from TOML or flags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Listen address
    pub bind_addr: String,
    /// Maximum concurrent pairings
    pub max_pairs: usize,
    /// Idle pairings are removed after this many seconds
    pub pair_timeout_secs: u64,
    /// Messages buffered for a peer that has not arrived yet
    #[serde(default = "default_pending_buffer")]
    pub pending_buffer: usize,
}

fn default_pending_buffer() -> usize {
    64
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4600".to_string(),
            max_pairs: 4096,
            pair_timeout_secs: 120,
            pending_buffer: 64,
        }
    }
}

impl RelayConfig {
    /// Minimum pair timeout (prevents accidental never-expire or thrash)
    const MIN_PAIR_TIMEOUT: u64 = 10;

    /// Clamp values into sane ranges
    pub fn validate(&mut self) {
        if self.pair_timeout_secs < Self::MIN_PAIR_TIMEOUT {
            self.pair_timeout_secs = Self::MIN_PAIR_TIMEOUT;
        }
        if self.pending_buffer == 0 {
            self.pending_buffer = default_pending_buffer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_clamps() {
        let mut config = RelayConfig {
            pair_timeout_secs: 1,
            pending_buffer: 0,
            ..Default::default()
        };
        config.validate();
        assert_eq!(config.pair_timeout_secs, 10);
        assert_eq!(config.pending_buffer, 64);
    }
}
