//! Node configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{P2pError, Result, DEFAULT_MAX_CONNECTIONS, DEFAULT_PORT};

/// Which applied mutations a node forwards to its other peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayPolicy {
    /// Relay every received mutation to all peers except its origin.
    #[default]
    Flood,
    /// Relay only mutations that changed local state.
    OnChange,
}

impl RelayPolicy {
    /// Whether a mutation should be relayed, given whether it changed
    /// local state.
    #[must_use]
    pub const fn should_relay(self, changed: bool) -> bool {
        match self {
            RelayPolicy::Flood => true,
            RelayPolicy::OnChange => changed,
        }
    }
}

/// Configuration for a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Host to bind the listener to.
    pub host: String,
    /// Port to listen on. Zero picks an ephemeral port.
    pub port: u16,
    /// Application version announced during the handshake.
    pub version: Option<i32>,
    /// Maximum number of open connections.
    pub max_connections: usize,
    /// How long `ping()` waits for its PONG, in milliseconds.
    pub ping_timeout_ms: u64,
    /// How long a handshake may take, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Forwarding policy for received mutations.
    pub relay_policy: RelayPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            version: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            ping_timeout_ms: 5_000,
            handshake_timeout_ms: 5_000,
            relay_policy: RelayPolicy::Flood,
        }
    }
}

impl NodeConfig {
    /// Ping timeout as a duration.
    #[must_use]
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Handshake timeout as a duration.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Checks the configuration for values a node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(P2pError::Configuration("host must not be empty".into()));
        }
        if self.max_connections == 0 {
            return Err(P2pError::Configuration(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.ping_timeout_ms == 0 || self.handshake_timeout_ms == 0 {
            return Err(P2pError::Configuration(
                "timeouts must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.port, 6000);
        assert_eq!(config.relay_policy, RelayPolicy::Flood);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"port": 3001, "relay_policy": "on_change"}"#).unwrap();
        assert_eq!(config.port, 3001);
        assert_eq!(config.relay_policy, RelayPolicy::OnChange);
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn rejects_zero_limits() {
        let config = NodeConfig {
            max_connections: 0,
            ..NodeConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(P2pError::Configuration(_))
        ));
    }

    #[test]
    fn relay_policy_decisions() {
        assert!(RelayPolicy::Flood.should_relay(false));
        assert!(RelayPolicy::OnChange.should_relay(true));
        assert!(!RelayPolicy::OnChange.should_relay(false));
    }
}
