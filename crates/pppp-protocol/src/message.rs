//! Protocol messages and their payload encodings.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::value::{get_blob32, get_str16, put_str16};
use crate::{Metadata, OpCode, ProtocolError, Result, Value, ValueKind};

/// Body of IDENTIFY and OK.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Handshake {
    /// Optional application version of the sender.
    pub version: Option<i32>,
    /// Send time in milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Optional free-form metadata.
    pub metadata: Option<Metadata>,
}

impl Handshake {
    fn encode(&self, buf: &mut BytesMut) {
        match self.version {
            Some(v) => {
                buf.put_u8(1);
                buf.put_i32(v);
            }
            None => buf.put_u8(0),
        }
        buf.put_i64(self.timestamp);
        match &self.metadata {
            Some(metadata) => {
                buf.put_u8(1);
                buf.put_u16(metadata.len().min(u16::MAX as usize) as u16);
                for (key, value) in metadata.iter().take(u16::MAX as usize) {
                    put_str16(buf, key);
                    value.encode(buf);
                }
            }
            None => buf.put_u8(0),
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self> {
        if buf.remaining() < 1 {
            return Err(ProtocolError::Malformed("truncated version flag".into()));
        }
        let version = match buf.get_u8() {
            0 => None,
            1 => {
                if buf.remaining() < 4 {
                    return Err(ProtocolError::Malformed("truncated version".into()));
                }
                Some(buf.get_i32())
            }
            b => {
                return Err(ProtocolError::Malformed(format!(
                    "invalid version flag: {b}"
                )))
            }
        };

        if buf.remaining() < 9 {
            return Err(ProtocolError::Malformed("truncated timestamp".into()));
        }
        let timestamp = buf.get_i64();

        let metadata = match buf.get_u8() {
            0 => None,
            1 => {
                if buf.remaining() < 2 {
                    return Err(ProtocolError::Malformed("truncated metadata count".into()));
                }
                let count = buf.get_u16() as usize;
                let mut metadata = Metadata::new();
                for _ in 0..count {
                    let key = get_str16(buf)?;
                    let value = Value::decode(buf)?;
                    metadata.insert(key, value);
                }
                Some(metadata)
            }
            b => {
                return Err(ProtocolError::Malformed(format!(
                    "invalid metadata flag: {b}"
                )))
            }
        };

        Ok(Handshake {
            version,
            timestamp,
            metadata,
        })
    }
}

/// An encoded object tagged with the codec that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPayload {
    /// Codec type tag.
    pub type_tag: u8,
    /// Codec output.
    pub data: Bytes,
}

impl ObjectPayload {
    /// Creates a new object payload.
    #[must_use]
    pub fn new(type_tag: u8, data: impl Into<Bytes>) -> Self {
        Self {
            type_tag,
            data: data.into(),
        }
    }

    /// Number of bytes this object takes inside a message payload.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + 4 + self.data.len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.type_tag);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self> {
        if buf.remaining() < 1 {
            return Err(ProtocolError::Malformed("truncated type tag".into()));
        }
        let type_tag = buf.get_u8();
        let data = get_blob32(buf, "object")?;
        Ok(ObjectPayload { type_tag, data })
    }
}

/// Names the property a CHANGE touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateHint {
    /// Kind of the changed property.
    pub kind: ValueKind,
    /// Name of the changed property, empty when the whole object changed.
    pub property: String,
}

impl UpdateHint {
    /// Creates a hint for a single property.
    #[must_use]
    pub fn new(kind: ValueKind, property: impl Into<String>) -> Self {
        Self {
            kind,
            property: property.into(),
        }
    }

    /// A hint covering the whole object.
    #[must_use]
    pub fn whole_object() -> Self {
        Self::new(ValueKind::Null, "")
    }

    /// Returns true if this hint does not name a single property.
    #[must_use]
    pub fn is_whole_object(&self) -> bool {
        self.property.is_empty()
    }
}

/// Body of CHANGE.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Identity hash of the object before the change.
    pub original_hash: i64,
    /// The object after the change.
    pub object: ObjectPayload,
    /// Which property changed.
    pub hint: UpdateHint,
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Handshake request.
    Identify(Handshake),
    /// Handshake acceptance.
    Ok(Handshake),
    /// Handshake refusal.
    Rejection,
    /// Latency check carrying its send timestamp.
    Ping(i64),
    /// Echo of a ping timestamp.
    Pong(i64),
    /// Forced disconnect.
    Kick,
    /// Full snapshot of the sender's stores.
    Initialize(Vec<ObjectPayload>),
    /// A new object.
    Creation(ObjectPayload),
    /// A changed object.
    Change(Change),
    /// Removal of the object with the given identity hash.
    Removal(i64),
}

impl Message {
    /// Returns the opcode of this message.
    #[must_use]
    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Identify(_) => OpCode::Identify,
            Message::Ok(_) => OpCode::Ok,
            Message::Rejection => OpCode::Rejection,
            Message::Ping(_) => OpCode::Ping,
            Message::Pong(_) => OpCode::Pong,
            Message::Kick => OpCode::Kick,
            Message::Initialize(_) => OpCode::Initialize,
            Message::Creation(_) => OpCode::Creation,
            Message::Change(_) => OpCode::Change,
            Message::Removal(_) => OpCode::Removal,
        }
    }

    /// Encode the payload of this message, without the opcode.
    #[must_use]
    pub fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::Identify(h) | Message::Ok(h) => h.encode(&mut buf),
            Message::Rejection | Message::Kick => {}
            Message::Ping(t) | Message::Pong(t) => buf.put_i64(*t),
            Message::Initialize(objects) => {
                buf.put_u32(objects.len() as u32);
                for object in objects {
                    object.encode(&mut buf);
                }
            }
            Message::Creation(object) => object.encode(&mut buf),
            Message::Change(change) => {
                buf.put_i64(change.original_hash);
                change.object.encode(&mut buf);
                buf.put_u8(change.hint.kind as u8);
                put_str16(&mut buf, &change.hint.property);
            }
            Message::Removal(hash) => buf.put_i64(*hash),
        }
        buf.freeze()
    }

    /// Encode the full frame: opcode byte followed by the payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let payload = self.encode_payload();
        let mut buf = BytesMut::with_capacity(1 + payload.len());
        buf.put_u8(self.opcode().as_byte());
        buf.put_slice(&payload);
        buf.freeze()
    }

    /// Decode the payload of a message whose opcode is already known.
    pub fn decode(opcode: OpCode, mut buf: &[u8]) -> Result<Self> {
        let message = match opcode {
            OpCode::Identify => Message::Identify(Handshake::decode(&mut buf)?),
            OpCode::Ok => Message::Ok(Handshake::decode(&mut buf)?),
            // No payload is required; anything present is ignored.
            OpCode::Rejection => return Ok(Message::Rejection),
            OpCode::Kick => return Ok(Message::Kick),
            OpCode::Ping => Message::Ping(get_i64(&mut buf, "ping timestamp")?),
            OpCode::Pong => Message::Pong(get_i64(&mut buf, "pong timestamp")?),
            OpCode::Initialize => {
                if buf.remaining() < 4 {
                    return Err(ProtocolError::Malformed("truncated object count".into()));
                }
                let count = buf.get_u32() as usize;
                // Every entry is at least five bytes long.
                let mut objects = Vec::with_capacity(count.min(buf.remaining() / 5));
                for _ in 0..count {
                    objects.push(ObjectPayload::decode(&mut buf)?);
                }
                Message::Initialize(objects)
            }
            OpCode::Creation => Message::Creation(ObjectPayload::decode(&mut buf)?),
            OpCode::Change => {
                let original_hash = get_i64(&mut buf, "original hash")?;
                let object = ObjectPayload::decode(&mut buf)?;
                if buf.remaining() < 1 {
                    return Err(ProtocolError::Malformed("truncated hint kind".into()));
                }
                let kind = ValueKind::from_byte(buf.get_u8())?;
                let property = get_str16(&mut buf)?;
                Message::Change(Change {
                    original_hash,
                    object,
                    hint: UpdateHint { kind, property },
                })
            }
            OpCode::Removal => Message::Removal(get_i64(&mut buf, "hash")?),
        };

        if buf.has_remaining() {
            return Err(ProtocolError::Malformed(format!(
                "{} trailing bytes after {opcode}",
                buf.remaining()
            )));
        }
        Ok(message)
    }

    /// Decode a full frame produced by [`Message::encode`].
    pub fn decode_frame(data: &[u8]) -> Result<Self> {
        let (&op, payload) = data
            .split_first()
            .ok_or_else(|| ProtocolError::Malformed("empty frame".into()))?;
        Self::decode(OpCode::from_byte(op)?, payload)
    }
}

fn get_i64(buf: &mut &[u8], what: &str) -> Result<i64> {
    if buf.remaining() < 8 {
        return Err(ProtocolError::Malformed(format!("truncated {what}")));
    }
    Ok(buf.get_i64())
}
