//! Built-in transform stages.

mod deflate;
mod encrypted;

pub use deflate::DeflateStage;
pub use encrypted::EncryptedStage;

use bytes::Bytes;

use crate::{Result, TransformStage};

/// Passes payloads through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpStage;

impl NoOpStage {
    /// Stage key.
    pub const KEY: u8 = 0;
}

impl TransformStage for NoOpStage {
    fn key(&self) -> u8 {
        Self::KEY
    }

    fn pack(&self, _host: &str, _port: u16, data: Bytes) -> Result<Bytes> {
        Ok(data)
    }

    fn consume(&self, _host: &str, _port: u16, data: Bytes) -> Result<Bytes> {
        Ok(data)
    }
}
