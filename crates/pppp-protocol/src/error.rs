//! Protocol error types.

use thiserror::Error;

/// Errors that can occur while encoding or decoding protocol data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The payload is malformed or truncated.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The opcode byte does not name a known message kind.
    #[error("unknown opcode: {0}")]
    UnknownOpCode(u8),

    /// A value carried an unknown kind tag.
    #[error("unknown value kind: {0}")]
    UnknownValueKind(u8),

    /// A value did not have the kind the reader expected.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// The kind the reader asked for.
        expected: &'static str,
        /// The kind actually present.
        found: &'static str,
    },

    /// The encoded structure exceeds a size limit.
    #[error("too large: {size} (max {max})")]
    TooLarge {
        /// The actual size.
        size: usize,
        /// The maximum allowed size.
        max: usize,
    },

    /// Nested values exceed the permitted depth.
    #[error("value nesting exceeds depth {0}")]
    TooDeep(usize),
}

/// A specialized Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
