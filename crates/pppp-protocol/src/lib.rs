//! # PPPP Protocol
//!
//! Wire definitions for the PPPP peer-to-peer object replication protocol.
//!
//! Every frame on the wire is an opcode byte followed by an opcode-specific
//! payload. This crate defines the opcodes, the tagged [`Value`] model used for
//! property values and handshake metadata, and the [`Message`] payload codec.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod message;
mod opcode;
mod value;

pub use error::{ProtocolError, Result};
pub use message::{Change, Handshake, Message, ObjectPayload, UpdateHint};
pub use opcode::OpCode;
pub use value::{Metadata, Value, ValueKind, MAX_VALUE_DEPTH};

/// Version of the PPPP wire protocol implemented by this crate.
pub const PPPP_VERSION: u32 = 2;

/// Maximum size of a single frame on the wire (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
