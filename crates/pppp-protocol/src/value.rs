//! Tagged values carried by properties and handshake metadata.
//!
//! A [`Value`] is encoded as a one-byte [`ValueKind`] followed by a
//! kind-specific body. Integers are big-endian, strings and byte blobs are
//! length-prefixed with a `u32`, map keys with a `u16`. Maps are ordered by
//! key, which makes the encoding of a value deterministic; the identity hash
//! relies on this.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{ProtocolError, Result};

/// Maximum nesting of lists and maps accepted when decoding.
pub const MAX_VALUE_DEPTH: usize = 32;

/// Free-form handshake metadata.
pub type Metadata = BTreeMap<String, Value>;

/// Kind discriminator of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueKind {
    /// No value.
    Null = 0,
    /// A boolean.
    Bool = 1,
    /// A signed 64-bit integer.
    Int = 2,
    /// A 64-bit float.
    Float = 3,
    /// UTF-8 text.
    Text = 4,
    /// Raw bytes.
    Bytes = 5,
    /// An ordered list of values.
    List = 6,
    /// A string-keyed map of values.
    Map = 7,
}

impl ValueKind {
    /// Parse a kind from its wire byte.
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(ValueKind::Null),
            1 => Ok(ValueKind::Bool),
            2 => Ok(ValueKind::Int),
            3 => Ok(ValueKind::Float),
            4 => Ok(ValueKind::Text),
            5 => Ok(ValueKind::Bytes),
            6 => Ok(ValueKind::List),
            7 => Ok(ValueKind::Map),
            _ => Err(ProtocolError::UnknownValueKind(b)),
        }
    }

    /// Human readable name of the kind.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Text => "text",
            ValueKind::Bytes => "bytes",
            ValueKind::List => "list",
            ValueKind::Map => "map",
        }
    }
}

/// A dynamically typed value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// No value.
    #[default]
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed 64-bit integer.
    Int(i64),
    /// A 64-bit float.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Bytes),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A string-keyed map of values.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Returns the kind of this value.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Text(_) => ValueKind::Text,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::List(_) => ValueKind::List,
            Value::Map(_) => ValueKind::Map,
        }
    }

    /// Returns true if this is [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Append the encoding of this value to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind() as u8);
        match self {
            Value::Null => {}
            Value::Bool(b) => buf.put_u8(u8::from(*b)),
            Value::Int(i) => buf.put_i64(*i),
            Value::Float(f) => buf.put_u64(f.to_bits()),
            Value::Text(s) => {
                buf.put_u32(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            Value::Bytes(b) => {
                buf.put_u32(b.len() as u32);
                buf.put_slice(b);
            }
            Value::List(items) => {
                buf.put_u32(items.len() as u32);
                for item in items {
                    item.encode(buf);
                }
            }
            Value::Map(entries) => {
                buf.put_u32(entries.len() as u32);
                for (key, value) in entries {
                    put_str16(buf, key);
                    value.encode(buf);
                }
            }
        }
    }

    /// Encode this value into a fresh buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one value from the front of `buf`, advancing it.
    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        Self::decode_nested(buf, 0)
    }

    /// Decode a value that must span all of `data`.
    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        let value = Self::decode(&mut data)?;
        if data.has_remaining() {
            return Err(ProtocolError::Malformed(format!(
                "{} trailing bytes after value",
                data.remaining()
            )));
        }
        Ok(value)
    }

    fn decode_nested(buf: &mut &[u8], depth: usize) -> Result<Self> {
        if depth > MAX_VALUE_DEPTH {
            return Err(ProtocolError::TooDeep(MAX_VALUE_DEPTH));
        }
        if buf.remaining() < 1 {
            return Err(ProtocolError::Malformed("truncated value kind".into()));
        }
        let kind = ValueKind::from_byte(buf.get_u8())?;
        match kind {
            ValueKind::Null => Ok(Value::Null),
            ValueKind::Bool => {
                if buf.remaining() < 1 {
                    return Err(ProtocolError::Malformed("truncated bool".into()));
                }
                match buf.get_u8() {
                    0 => Ok(Value::Bool(false)),
                    1 => Ok(Value::Bool(true)),
                    b => Err(ProtocolError::Malformed(format!("invalid bool byte: {b}"))),
                }
            }
            ValueKind::Int => {
                if buf.remaining() < 8 {
                    return Err(ProtocolError::Malformed("truncated int".into()));
                }
                Ok(Value::Int(buf.get_i64()))
            }
            ValueKind::Float => {
                if buf.remaining() < 8 {
                    return Err(ProtocolError::Malformed("truncated float".into()));
                }
                Ok(Value::Float(f64::from_bits(buf.get_u64())))
            }
            ValueKind::Text => {
                let raw = get_blob32(buf, "text")?;
                let text = String::from_utf8(raw.to_vec())
                    .map_err(|e| ProtocolError::Malformed(format!("invalid text: {e}")))?;
                Ok(Value::Text(text))
            }
            ValueKind::Bytes => Ok(Value::Bytes(get_blob32(buf, "bytes")?)),
            ValueKind::List => {
                let count = get_count(buf, "list")?;
                let mut items = Vec::with_capacity(count.min(buf.remaining()));
                for _ in 0..count {
                    items.push(Self::decode_nested(buf, depth + 1)?);
                }
                Ok(Value::List(items))
            }
            ValueKind::Map => {
                let count = get_count(buf, "map")?;
                let mut entries = BTreeMap::new();
                for _ in 0..count {
                    let key = get_str16(buf)?;
                    let value = Self::decode_nested(buf, depth + 1)?;
                    entries.insert(key, value);
                }
                Ok(Value::Map(entries))
            }
        }
    }
}

/// Write a `u16` length-prefixed UTF-8 string.
///
/// Strings longer than `u16::MAX` bytes are truncated at a char boundary.
pub(crate) fn put_str16(buf: &mut BytesMut, s: &str) {
    let mut end = s.len().min(u16::MAX as usize);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    buf.put_u16(end as u16);
    buf.put_slice(&s.as_bytes()[..end]);
}

/// Read a `u16` length-prefixed UTF-8 string.
pub(crate) fn get_str16(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::Malformed("truncated string length".into()));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::Malformed("truncated string".into()));
    }
    let s = String::from_utf8(buf[..len].to_vec())
        .map_err(|e| ProtocolError::Malformed(format!("invalid string: {e}")))?;
    buf.advance(len);
    Ok(s)
}

/// Read a `u32` length-prefixed blob.
pub(crate) fn get_blob32(buf: &mut &[u8], what: &str) -> Result<Bytes> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Malformed(format!("truncated {what} length")));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::Malformed(format!("truncated {what}")));
    }
    let data = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(data)
}

fn get_count(buf: &mut &[u8], what: &str) -> Result<usize> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Malformed(format!("truncated {what} count")));
    }
    Ok(buf.get_u32() as usize)
}

fn mismatch(expected: ValueKind, found: &Value) -> ProtocolError {
    ProtocolError::TypeMismatch {
        expected: expected.name(),
        found: found.kind().name(),
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(v))
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl TryFrom<Value> for bool {
    type Error = ProtocolError;

    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Bool(b) => Ok(b),
            other => Err(mismatch(ValueKind::Bool, &other)),
        }
    }
}

impl TryFrom<Value> for i64 {
    type Error = ProtocolError;

    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Int(i) => Ok(i),
            other => Err(mismatch(ValueKind::Int, &other)),
        }
    }
}

impl TryFrom<Value> for i32 {
    type Error = ProtocolError;

    fn try_from(v: Value) -> Result<Self> {
        let wide = i64::try_from(v)?;
        i32::try_from(wide)
            .map_err(|_| ProtocolError::Malformed(format!("integer {wide} out of range for i32")))
    }
}

impl TryFrom<Value> for f64 {
    type Error = ProtocolError;

    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Float(f) => Ok(f),
            other => Err(mismatch(ValueKind::Float, &other)),
        }
    }
}

impl TryFrom<Value> for String {
    type Error = ProtocolError;

    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Text(s) => Ok(s),
            other => Err(mismatch(ValueKind::Text, &other)),
        }
    }
}

impl TryFrom<Value> for Bytes {
    type Error = ProtocolError;

    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Bytes(b) => Ok(b),
            other => Err(mismatch(ValueKind::Bytes, &other)),
        }
    }
}

impl TryFrom<Value> for Vec<Value> {
    type Error = ProtocolError;

    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::List(items) => Ok(items),
            other => Err(mismatch(ValueKind::List, &other)),
        }
    }
}

impl TryFrom<Value> for BTreeMap<String, Value> {
    type Error = ProtocolError;

    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Map(entries) => Ok(entries),
            other => Err(mismatch(ValueKind::Map, &other)),
        }
    }
}
