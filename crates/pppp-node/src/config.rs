//! Node configuration loading.
//!
//! Sources are layered in order: an optional file (YAML, TOML or JSON, picked
//! by extension), then `PPPP_`-prefixed environment variables, then CLI
//! flags applied by the binary. Nested keys use `__` in the environment, so
//! `PPPP_NODE__PORT=6001` sets `node.port` and `PPPP_PEERS=a:1,b:2` sets the
//! peer list.

use std::path::Path;

use anyhow::{bail, Context};
use config::{Environment, File};
use pppp_p2p::NodeConfig;
use serde::{Deserialize, Serialize};

/// Configuration for the node binary.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Replication node settings.
    pub node: NodeConfig,
    /// Peers to dial at startup, as `host:port`.
    pub peers: Vec<String>,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Log format ("pretty" or "json").
    pub log_format: String,
    /// Seconds between latency checks. Zero disables them.
    pub ping_interval_secs: u64,
    /// Passphrase for payload encryption. Peers must share it.
    pub passphrase: Option<String>,
    /// Compress payloads before they are sent.
    pub compress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            peers: Vec::new(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            ping_interval_secs: 10,
            passphrase: None,
            compress: false,
        }
    }
}

impl Config {
    /// Loads the file at `path`, if any, and overlays the environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config = builder
            .add_source(
                Environment::with_prefix("PPPP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("peers"),
            )
            .build()
            .context("reading configuration")?
            .try_deserialize::<Self>()
            .context("invalid configuration")?;
        config.node.validate()?;
        Ok(config)
    }

    /// Parses the peer list into host/port pairs.
    pub fn peer_addrs(&self) -> anyhow::Result<Vec<(String, u16)>> {
        self.peers.iter().map(|peer| parse_peer(peer)).collect()
    }
}

/// Splits `host:port`. IPv6 hosts may be bracketed.
pub fn parse_peer(peer: &str) -> anyhow::Result<(String, u16)> {
    let Some((host, port)) = peer.rsplit_once(':') else {
        bail!("peer {peer:?} is not host:port");
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        bail!("peer {peer:?} has an empty host");
    }
    let port = port
        .parse()
        .with_context(|| format!("peer {peer:?} has an invalid port"))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pppp_p2p::RelayPolicy;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn defaults_without_sources() {
        let config = Config::default();
        assert_eq!(config.node.port, pppp_p2p::DEFAULT_PORT);
        assert_eq!(config.ping_interval_secs, 10);
        assert!(config.peers.is_empty());
    }

    #[test]
    fn loads_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "node:\n  port: 6100\n  version: 3\n  relay_policy: on_change\npeers:\n  - 10.0.0.2:6000\ncompress: true"
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.node.port, 6100);
        assert_eq!(config.node.version, Some(3));
        assert_eq!(config.node.relay_policy, RelayPolicy::OnChange);
        assert_eq!(config.node.max_connections, pppp_p2p::DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.peers, vec!["10.0.0.2:6000".to_string()]);
        assert!(config.compress);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn rejects_invalid_node_settings() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"node": {{"max_connections": 0}}}}"#).unwrap();
        assert!(Config::load(Some(file.path())).is_err());
    }

    #[test]
    fn parses_peers() {
        assert_eq!(
            parse_peer("127.0.0.1:6000").unwrap(),
            ("127.0.0.1".to_string(), 6000)
        );
        assert_eq!(parse_peer("[::1]:7000").unwrap(), ("::1".to_string(), 7000));
        assert!(parse_peer("no-port").is_err());
        assert!(parse_peer(":6000").is_err());
        assert!(parse_peer("host:99999").is_err());
    }
}
