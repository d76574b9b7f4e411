//! P2P error types.

use thiserror::Error;

/// Errors that can occur during P2P operations.
#[derive(Debug, Error)]
pub enum P2pError {
    /// The handshake was vetoed locally or refused by the peer.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// A store operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] pppp_storage::StorageError),

    /// A frame could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] pppp_protocol::ProtocolError),

    /// A transform stage rejected a payload.
    #[error("transform stage {key} failed: {reason}")]
    Transform {
        /// Key of the failing stage.
        key: u8,
        /// Why the stage failed.
        reason: String,
    },

    /// An operation did not complete in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The connection is closed.
    #[error("transport closed")]
    TransportClosed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Maximum connections reached.
    #[error("maximum connections reached: {0}")]
    MaxConnections(usize),

    /// A transform stage with the same key is already registered.
    #[error("duplicate transform stage key: {0}")]
    DuplicateStage(u8),

    /// No store is registered for the type.
    #[error("type not registered: {0}")]
    NotRegistered(&'static str),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// A specialized Result type for P2P operations.
pub type Result<T> = std::result::Result<T, P2pError>;
