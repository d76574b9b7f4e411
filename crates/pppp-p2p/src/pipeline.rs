//! Ordered transform stages applied to frame payloads.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::{P2pError, Result};

/// One reversible transformation of payload bytes.
///
/// `consume` must invert `pack` for the same host and port. The peer address
/// lets a stage apply per-peer policy such as distinct keys.
pub trait TransformStage: Send + Sync + 'static {
    /// Unique key of the stage within a pipeline.
    fn key(&self) -> u8;

    /// Transforms an outbound payload.
    fn pack(&self, host: &str, port: u16, data: Bytes) -> Result<Bytes>;

    /// Reverses [`TransformStage::pack`] on an inbound payload.
    fn consume(&self, host: &str, port: u16, data: Bytes) -> Result<Bytes>;
}

/// Stages applied in registration order on the way out and in reverse order
/// on the way in.
#[derive(Default, Clone)]
pub struct TransformPipeline {
    stages: Vec<Arc<dyn TransformStage>>,
}

impl TransformPipeline {
    /// Creates an empty pipeline, which passes payloads through unchanged.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage. Its key must not already be in use.
    pub fn add(&mut self, stage: impl TransformStage) -> Result<()> {
        self.add_arc(Arc::new(stage))
    }

    /// Appends a shared stage. Its key must not already be in use.
    pub fn add_arc(&mut self, stage: Arc<dyn TransformStage>) -> Result<()> {
        let key = stage.key();
        if self.stages.iter().any(|s| s.key() == key) {
            return Err(P2pError::DuplicateStage(key));
        }
        self.stages.push(stage);
        Ok(())
    }

    /// Keys of the registered stages in application order.
    #[must_use]
    pub fn keys(&self) -> Vec<u8> {
        self.stages.iter().map(|s| s.key()).collect()
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the pipeline has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs every stage's `pack` in registration order.
    pub fn pack(&self, host: &str, port: u16, data: Bytes) -> Result<Bytes> {
        self.stages
            .iter()
            .try_fold(data, |data, stage| stage.pack(host, port, data))
    }

    /// Runs every stage's `consume` in reverse registration order.
    pub fn consume(&self, host: &str, port: u16, data: Bytes) -> Result<Bytes> {
        self.stages
            .iter()
            .rev()
            .try_fold(data, |data, stage| stage.consume(host, port, data))
    }
}

impl fmt::Debug for TransformPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformPipeline")
            .field("keys", &self.keys())
            .finish()
    }
}
