//! Command line flags.

use std::path::PathBuf;

use anyhow::bail;
use clap::Parser;
use pppp_p2p::RelayPolicy;

use crate::config::Config;
use crate::demo::Note;

/// PPPP node - replicates notes with its peers
#[derive(Parser, Debug)]
#[command(name = "pppp-node")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind the listener to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Version announced during the handshake
    #[arg(long)]
    pub protocol_version: Option<i32>,

    /// Peer to connect to at startup (host:port); may be repeated
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// Only relay mutations that changed local state
    #[arg(long)]
    pub relay_on_change: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// Author of the notes posted with --post
    #[arg(long, default_value = "anonymous")]
    pub author: String,

    /// Note to post once connected, as title=body; may be repeated
    #[arg(long = "post")]
    pub posts: Vec<String>,

    /// New body for a note by --author, as title=body; may be repeated
    #[arg(long = "edit")]
    pub edits: Vec<String>,
}

impl Cli {
    /// Overlays the flags that were given onto `config`.
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.node.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.node.port = port;
        }
        if let Some(version) = self.protocol_version {
            config.node.version = Some(version);
        }
        if self.relay_on_change {
            config.node.relay_policy = RelayPolicy::OnChange;
        }
        config.peers.extend(self.peers.iter().cloned());
        if let Some(level) = &self.log_level {
            config.log_level.clone_from(level);
        }
        if self.json_logs {
            config.log_format = "json".to_string();
        }
    }

    /// Parses the `--post` flags into notes by `--author`.
    pub fn notes(&self) -> anyhow::Result<Vec<Note>> {
        self.posts
            .iter()
            .map(|post| {
                let (title, body) = title_and_body(post)?;
                Ok(Note::new(self.author.as_str(), title, body))
            })
            .collect()
    }

    /// Parses the `--edit` flags into `(title, body)` pairs.
    pub fn edits(&self) -> anyhow::Result<Vec<(String, String)>> {
        self.edits
            .iter()
            .map(|edit| {
                let (title, body) = title_and_body(edit)?;
                Ok((title.to_string(), body.to_string()))
            })
            .collect()
    }
}

fn title_and_body(flag: &str) -> anyhow::Result<(&str, &str)> {
    match flag.split_once('=') {
        Some((title, body)) if !title.is_empty() => Ok((title, body)),
        _ => bail!("{flag:?} is not title=body"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "pppp-node",
            "--port",
            "6200",
            "--peer",
            "10.0.0.3:6000",
            "--relay-on-change",
            "--json-logs",
        ]);
        let mut config = Config {
            peers: vec!["10.0.0.2:6000".into()],
            ..Config::default()
        };
        cli.apply(&mut config);

        assert_eq!(config.node.port, 6200);
        assert_eq!(config.node.relay_policy, RelayPolicy::OnChange);
        assert_eq!(config.peers, vec!["10.0.0.2:6000", "10.0.0.3:6000"]);
        assert_eq!(config.log_format, "json");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn absent_flags_leave_config_alone() {
        let cli = Cli::parse_from(["pppp-node"]);
        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn parses_posts() {
        let cli = Cli::parse_from([
            "pppp-node",
            "--author",
            "ana",
            "--post",
            "greeting=hello there",
        ]);
        assert_eq!(
            cli.notes().unwrap(),
            vec![Note::new("ana", "greeting", "hello there")]
        );

        let bad = Cli::parse_from(["pppp-node", "--post", "=body"]);
        assert!(bad.notes().is_err());
    }

    #[test]
    fn parses_edits() {
        let cli = Cli::parse_from(["pppp-node", "--edit", "greeting=hi=again"]);
        assert_eq!(
            cli.edits().unwrap(),
            vec![("greeting".to_string(), "hi=again".to_string())]
        );

        let bad = Cli::parse_from(["pppp-node", "--edit", "no separator"]);
        assert!(bad.edits().is_err());
    }
}
