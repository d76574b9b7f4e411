//! Fuzz target for inbound transform stages.
//!
//! Stages consume attacker-controlled bytes before any protocol decoding.

#![no_main]

use arbitrary::Arbitrary;
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use pppp_p2p::stages::{DeflateStage, EncryptedStage, NoOpStage};
use pppp_p2p::TransformPipeline;

#[derive(Debug, Arbitrary)]
struct Input {
    compress: bool,
    encrypt: bool,
    payload: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let mut pipeline = TransformPipeline::new();
    let _ = pipeline.add(NoOpStage);
    if input.compress {
        let _ = pipeline.add(DeflateStage::default());
    }
    if input.encrypt {
        let _ = pipeline.add(EncryptedStage::new("fuzz"));
    }

    let payload = Bytes::from(input.payload);
    let _ = pipeline.consume("127.0.0.1", 6000, payload.clone());

    let packed = pipeline
        .pack("127.0.0.1", 6000, payload.clone())
        .expect("packing never fails");
    let consumed = pipeline
        .consume("127.0.0.1", 6000, packed)
        .expect("packed payloads consume");
    assert_eq!(consumed, payload);
});
