//! DEFLATE payload compression.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use pppp_protocol::MAX_FRAME_SIZE;

use crate::{P2pError, Result, TransformStage};

/// Compresses every payload with raw DEFLATE.
#[derive(Debug, Clone, Copy)]
pub struct DeflateStage {
    level: Compression,
}

impl DeflateStage {
    /// Stage key.
    pub const KEY: u8 = 2;

    /// Creates a stage with the given compression level (0-9).
    #[must_use]
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }

    fn error(reason: String) -> P2pError {
        P2pError::Transform {
            key: Self::KEY,
            reason,
        }
    }
}

impl Default for DeflateStage {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl TransformStage for DeflateStage {
    fn key(&self) -> u8 {
        Self::KEY
    }

    fn pack(&self, _host: &str, _port: u16, data: Bytes) -> Result<Bytes> {
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), self.level);
        encoder
            .write_all(&data)
            .map_err(|e| Self::error(format!("compress failed: {e}")))?;
        let compressed = encoder
            .finish()
            .map_err(|e| Self::error(format!("compress failed: {e}")))?;
        Ok(compressed.into())
    }

    fn consume(&self, _host: &str, _port: u16, data: Bytes) -> Result<Bytes> {
        let mut out = Vec::new();
        DeflateDecoder::new(data.as_ref())
            .take(MAX_FRAME_SIZE as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| Self::error(format!("decompress failed: {e}")))?;
        if out.len() > MAX_FRAME_SIZE {
            return Err(Self::error(format!(
                "decompressed payload exceeds {MAX_FRAME_SIZE} bytes"
            )));
        }
        Ok(out.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compresses_repetitive_data() {
        let stage = DeflateStage::new(9);
        let data = Bytes::from(vec![b'a'; 4096]);
        let packed = stage.pack("h", 1, data.clone()).unwrap();
        assert!(packed.len() < data.len() / 10);
        assert_eq!(stage.consume("h", 1, packed).unwrap(), data);
    }

    #[test]
    fn garbage_rejected() {
        let stage = DeflateStage::default();
        assert!(stage
            .consume("h", 1, Bytes::from_static(&[0xff, 0xff, 0xff, 0xff]))
            .is_err());
    }
}
