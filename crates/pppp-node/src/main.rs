//! PPPP Node - peer-to-peer note replication.

use clap::Parser;
use pppp_node::cli::Cli;
use pppp_node::config::Config;
use pppp_node::observability::{init_logging, LogFormat};
use pppp_node::runner;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.node.validate()?;
    let notes = cli.notes()?;
    let edits = cli.edits()?;

    init_logging(&config.log_level, LogFormat::parse(&config.log_format));
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting PPPP node");

    let node = runner::start(&config).await?;
    tracing::info!(
        listen_addr = %node.local_addr(),
        peers = config.peers.len(),
        relay_policy = ?config.node.relay_policy,
        "node configuration"
    );

    let connected = runner::connect_peers(&node, &config).await?;
    tracing::info!(connected, "peers dialed");

    for note in notes {
        let posted = node.persist_handle(note)?;
        tracing::info!(hash = %posted.hash(), "posted note");
    }
    for (title, body) in edits {
        match runner::edit(&node, &cli.author, &title, &body) {
            Ok(_) => tracing::info!(%title, "edited note"),
            Err(e) => tracing::warn!(%title, error = %e, "could not edit note"),
        }
    }

    tracing::info!("node is ready. Press Ctrl+C to stop.");
    runner::serve(node, &config, shutdown_signal()).await;
    tracing::info!("node stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            }
            _ => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
