//! # PPPP P2P
//!
//! Networking layer for PPPP nodes.
//!
//! A [`Node`] listens for peers, dials others with [`Node::connect_to`] and
//! keeps one replicated [`Store`](pppp_storage::Store) per registered type.
//! Loud store mutations are broadcast to every open connection; mutations
//! received from a peer are applied quietly and relayed onwards according
//! to the node's [`RelayPolicy`].
//!
//! Every frame payload passes through the node's [`TransformPipeline`], so
//! compression and encryption are configured once per node. A
//! [`ConnectionSpy`] observes handshakes and may veto them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connection;
mod error;
mod failable;
mod node;
mod pipeline;
mod session;
mod spy;
pub mod stages;

pub use config::{NodeConfig, RelayPolicy};
pub use connection::{Connection, ConnectionSet, ConnectionState, Role};
pub use error::{P2pError, Result};
pub use failable::FailableValue;
pub use node::{Node, NodeBuilder, StoreFactory};
pub use pipeline::{TransformPipeline, TransformStage};
pub use spy::{ConnectionSpy, NoOpConnectionSpy, VersionSpy};

use std::time::{SystemTime, UNIX_EPOCH};

/// Default port for PPPP connections.
pub const DEFAULT_PORT: u16 = 6000;

/// Default maximum number of open connections per node.
pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
