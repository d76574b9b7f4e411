//! Node lifecycle: startup, latency checks and shutdown.

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use pppp_p2p::stages::{DeflateStage, EncryptedStage};
use pppp_p2p::Node;
use pppp_protocol::Value;
use pppp_storage::Persisted;
use tracing::{info, warn};

use crate::config::Config;
use crate::demo::{Note, BODY, NOTE_TAG};

/// Builds and starts a node for `config`.
pub async fn start(config: &Config) -> anyhow::Result<Node> {
    let mut builder = Node::builder().config(config.node.clone());
    if config.compress {
        builder = builder.stage(DeflateStage::default())?;
    }
    if let Some(passphrase) = &config.passphrase {
        builder = builder.stage(EncryptedStage::new(passphrase))?;
    }
    builder
        .register::<Note>(NOTE_TAG)?
        .build()
        .await
        .context("starting node")
}

/// Dials every configured peer. Failures are logged and skipped.
pub async fn connect_peers(node: &Node, config: &Config) -> anyhow::Result<usize> {
    let mut connected = 0;
    for (host, port) in config.peer_addrs()? {
        match node.connect_to(&host, port, None).await {
            Ok(connection) => {
                info!(peer = %host, port, id = connection.id(), "connected to peer");
                connected += 1;
            }
            Err(e) => warn!(peer = %host, port, error = %e, "could not connect to peer"),
        }
    }
    Ok(connected)
}

/// Replaces the body of the note `author` posted under `title`.
///
/// The peers receive a CHANGE hinted with the body property.
pub fn edit(node: &Node, author: &str, title: &str, body: &str) -> anyhow::Result<Note> {
    let hash = node.generate_hash(&Note::new(author, title, ""));
    let note = Persisted::attach(node.store::<Note>()?, hash);
    note.set(BODY, Value::from(body))
        .with_context(|| format!("editing note {title:?}"))
}

/// Runs `node` until `shutdown` resolves, pinging every peer every
/// `ping_interval_secs`.
pub async fn serve(node: Node, config: &Config, shutdown: impl Future<Output = ()>) {
    tokio::pin!(shutdown);

    let interval = Duration::from_secs(config.ping_interval_secs);
    let mut ticker = (!interval.is_zero()).then(|| tokio::time::interval(interval));

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = async {
                match ticker.as_mut() {
                    Some(ticker) => {
                        ticker.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => report(&node),
        }
    }

    info!("shutdown signal received");
    node.shutdown();
}

fn report(node: &Node) {
    let notes = node.store::<Note>().map(|store| store.len()).unwrap_or_default();
    let connections = node.connections();
    info!(peers = connections.len(), notes, "status");

    for connection in connections {
        tokio::spawn(async move {
            match connection.ping().await {
                Ok(latency_ms) => info!(
                    peer = %connection.host(),
                    port = connection.port(),
                    latency_ms,
                    "latency"
                ),
                Err(e) => warn!(
                    peer = %connection.host(),
                    port = connection.port(),
                    error = %e,
                    "ping failed"
                ),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pppp_p2p::NodeConfig;

    fn local(passphrase: Option<&str>) -> Config {
        Config {
            node: NodeConfig {
                host: "127.0.0.1".into(),
                port: 0,
                ..NodeConfig::default()
            },
            passphrase: passphrase.map(str::to_string),
            compress: true,
            ping_interval_secs: 1,
            ..Config::default()
        }
    }

    async fn eventually(condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within 5s");
    }

    #[tokio::test]
    async fn nodes_started_from_config_replicate() {
        let first = start(&local(Some("shared"))).await.unwrap();

        let mut second_config = local(Some("shared"));
        second_config.peers = vec![format!("127.0.0.1:{}", first.local_addr().port())];
        let second = start(&second_config).await.unwrap();
        assert_eq!(connect_peers(&second, &second_config).await.unwrap(), 1);
        eventually(|| !first.connections().is_empty()).await;

        let hash = first.persist(Note::new("ana", "hi", "there")).unwrap();
        let notes = second.store::<Note>().unwrap();
        eventually(|| notes.contains_hash(hash)).await;

        first.shutdown();
        second.shutdown();
    }

    #[tokio::test]
    async fn edits_replicate_as_body_changes() {
        let first = start(&local(None)).await.unwrap();
        let mut second_config = local(None);
        second_config.peers = vec![format!("127.0.0.1:{}", first.local_addr().port())];
        let second = start(&second_config).await.unwrap();
        connect_peers(&second, &second_config).await.unwrap();
        eventually(|| !first.connections().is_empty()).await;

        let posted = first
            .persist_handle(Note::new("ana", "plans", "draft"))
            .unwrap();
        let notes = second.store::<Note>().unwrap();
        eventually(|| notes.contains_hash(posted.hash())).await;

        let edited = edit(&second, "ana", "plans", "final").unwrap();
        assert_eq!(edited.body, "final");
        eventually(|| posted.get().is_some_and(|n| n.body == "final")).await;
        assert!(edit(&second, "ana", "missing", "x").is_err());

        first.shutdown();
        second.shutdown();
    }

    #[tokio::test]
    async fn unreachable_peers_are_skipped() {
        let config = Config {
            peers: vec!["127.0.0.1:1".into()],
            ..local(None)
        };
        let node = start(&config).await.unwrap();
        assert_eq!(connect_peers(&node, &config).await.unwrap(), 0);
        node.shutdown();
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown() {
        let config = local(None);
        let node = start(&config).await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            serve(node, &config, async {
                let _ = rx.await;
            })
            .await;
        });
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
