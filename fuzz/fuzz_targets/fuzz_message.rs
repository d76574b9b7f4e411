//! Fuzz target for protocol message decoding.
//!
//! Frames come straight from peers, so no input may panic the decoder.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pppp_protocol::{Message, OpCode};

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = Message::decode_frame(data) {
        // Whatever decodes must re-encode to a stable frame.
        let reencoded = message.encode();
        let again = Message::decode_frame(&reencoded).map(|m| m.encode());
        assert_eq!(again.ok(), Some(reencoded));
    }

    // The payload alone under every opcode.
    for opcode in OpCode::ALL {
        let _ = Message::decode(opcode, data);
    }
});
