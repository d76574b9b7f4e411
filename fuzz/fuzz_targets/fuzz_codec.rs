//! Fuzz target for the property codec that decodes objects sent by peers.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pppp_protocol::{ObjectPayload, Value, ValueKind};
use pppp_storage::{CodecRegistry, Persist, Property, PropertyCodec};

#[derive(Debug, Clone, Default, PartialEq)]
struct Entry {
    key: String,
    count: i64,
    flag: bool,
}

impl Persist for Entry {
    const TYPE_NAME: &'static str = "Entry";

    fn properties() -> Vec<Property<Self>> {
        vec![
            Property::identity(
                "key",
                ValueKind::Text,
                |e: &Entry| Value::from(e.key.as_str()),
                |e: &mut Entry, v| {
                    e.key = v.try_into()?;
                    Ok(())
                },
            ),
            Property::data(
                "count",
                ValueKind::Int,
                |e: &Entry| Value::Int(e.count),
                |e: &mut Entry, v| {
                    e.count = v.try_into()?;
                    Ok(())
                },
            ),
            Property::data(
                "flag",
                ValueKind::Bool,
                |e: &Entry| Value::Bool(e.flag),
                |e: &mut Entry, v| {
                    e.flag = v.try_into()?;
                    Ok(())
                },
            ),
        ]
    }
}

fuzz_target!(|data: &[u8]| {
    let Some((&tag, bytes)) = data.split_first() else {
        return;
    };
    let mut codecs = CodecRegistry::new();
    if codecs.register(PropertyCodec::<Entry>::new(1)).is_err() {
        return;
    }

    // Anything accepted must survive a second trip.
    let payload = ObjectPayload::new(tag % 2, bytes.to_vec());
    if let Ok(object) = codecs.decode(&payload) {
        let Some(entry) = object.downcast_ref::<Entry>() else {
            panic!("codec produced a foreign type");
        };
        let reencoded = codecs.encode(entry).expect("decoded entries encode");
        let again = codecs.decode(&reencoded).expect("encoded entries decode");
        assert_eq!(again.downcast_ref::<Entry>(), Some(entry));
    }
});
