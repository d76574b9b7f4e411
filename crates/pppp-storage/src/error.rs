//! Storage error types.

use pppp_protocol::ProtocolError;
use thiserror::Error;

use crate::IdentityHash;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No entry exists under the given identity hash.
    #[error("not found: {0}")]
    NotFound(IdentityHash),

    /// No registered codec accepts the type.
    #[error("no codec registered for {0}")]
    NoCodec(&'static str),

    /// No registered codec carries the type tag.
    #[error("unknown type tag: {0}")]
    UnknownTypeTag(u8),

    /// A codec with the same type tag is already registered.
    #[error("duplicate type tag: {0}")]
    DuplicateTag(u8),

    /// The type has no property with the given name.
    #[error("{type_name} has no property named {name:?}")]
    UnknownProperty {
        /// Name of the persisted type.
        type_name: &'static str,
        /// The requested property.
        name: String,
    },

    /// An object was handed to a codec or store of a different type.
    #[error("type mismatch: expected {0}")]
    TypeMismatch(&'static str),

    /// Encoding or decoding object bytes failed.
    #[error("codec error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// A specialized Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
