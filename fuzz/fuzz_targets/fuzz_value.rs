//! Fuzz target for the tagged value decoder used by metadata and codecs.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pppp_protocol::Value;

fuzz_target!(|data: &[u8]| {
    if let Ok(value) = Value::from_bytes(data) {
        // Compared as bytes since NaN never equals itself.
        let reencoded = value.to_bytes();
        let again = Value::from_bytes(&reencoded).map(|v| v.to_bytes());
        assert_eq!(again.ok(), Some(reencoded));
    }
});
