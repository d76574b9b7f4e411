//! Protocol opcodes.

use crate::{ProtocolError, Result};

/// Message kinds understood by the protocol.
///
/// The wire value of each opcode is its declaration ordinal. New opcodes may
/// only ever be appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Handshake request sent by the connecting side.
    Identify = 0,
    /// Handshake acceptance.
    Ok = 1,
    /// Handshake refusal.
    Rejection = 2,
    /// Latency check.
    Ping = 3,
    /// Latency check answer, echoing the ping timestamp.
    Pong = 4,
    /// Forced disconnect.
    Kick = 5,
    /// Full snapshot of every local store.
    Initialize = 6,
    /// A new object.
    Creation = 7,
    /// A changed object.
    Change = 8,
    /// A removed object.
    Removal = 9,
}

impl OpCode {
    /// All opcodes in wire order.
    pub const ALL: [OpCode; 10] = [
        OpCode::Identify,
        OpCode::Ok,
        OpCode::Rejection,
        OpCode::Ping,
        OpCode::Pong,
        OpCode::Kick,
        OpCode::Initialize,
        OpCode::Creation,
        OpCode::Change,
        OpCode::Removal,
    ];

    /// Parse an opcode from its wire byte.
    pub fn from_byte(b: u8) -> Result<Self> {
        Self::ALL
            .get(b as usize)
            .copied()
            .ok_or(ProtocolError::UnknownOpCode(b))
    }

    /// Returns the wire byte of this opcode.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns true for the opcodes that mutate replicated state.
    #[must_use]
    pub const fn is_mutation(self) -> bool {
        matches!(
            self,
            OpCode::Initialize | OpCode::Creation | OpCode::Change | OpCode::Removal
        )
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OpCode::Identify => "IDENTIFY",
            OpCode::Ok => "OK",
            OpCode::Rejection => "REJECTION",
            OpCode::Ping => "PING",
            OpCode::Pong => "PONG",
            OpCode::Kick => "KICK",
            OpCode::Initialize => "INITIALIZE",
            OpCode::Creation => "CREATION",
            OpCode::Change => "CHANGE",
            OpCode::Removal => "REMOVAL",
        };
        f.write_str(name)
    }
}
