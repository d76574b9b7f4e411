//! The note type replicated by the demo node.

use pppp_protocol::{Value, ValueKind};
use pppp_storage::{Persist, Property};

/// Type tag of [`Note`] on the wire.
pub const NOTE_TAG: u8 = 1;

/// Name of the note property that can change without moving the note.
pub const BODY: &str = "body";

/// A short message shared between nodes.
///
/// A note is identified by its author and title; the body can change
/// without moving the note.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Note {
    /// Who wrote the note.
    pub author: String,
    /// Title, unique per author.
    pub title: String,
    /// Free text.
    pub body: String,
}

impl Note {
    /// Creates a note.
    pub fn new(
        author: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            author: author.into(),
            title: title.into(),
            body: body.into(),
        }
    }
}

impl Persist for Note {
    const TYPE_NAME: &'static str = "Note";

    fn properties() -> Vec<Property<Self>> {
        vec![
            Property::identity(
                "author",
                ValueKind::Text,
                |n: &Note| Value::from(n.author.as_str()),
                |n: &mut Note, v| {
                    n.author = v.try_into()?;
                    Ok(())
                },
            ),
            Property::identity(
                "title",
                ValueKind::Text,
                |n: &Note| Value::from(n.title.as_str()),
                |n: &mut Note, v| {
                    n.title = v.try_into()?;
                    Ok(())
                },
            ),
            Property::data(
                BODY,
                ValueKind::Text,
                |n: &Note| Value::from(n.body.as_str()),
                |n: &mut Note, v| {
                    n.body = v.try_into()?;
                    Ok(())
                },
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pppp_storage::{generate_hash, CodecRegistry, PropertyCodec};
    use pretty_assertions::assert_eq;

    #[test]
    fn body_does_not_affect_identity() {
        let a = Note::new("ana", "hello", "first");
        let b = Note::new("ana", "hello", "second");
        assert_eq!(generate_hash(&a), generate_hash(&b));
        assert_ne!(
            generate_hash(&a),
            generate_hash(&Note::new("bo", "hello", "first"))
        );
    }

    #[test]
    fn codec_carries_every_property() {
        let mut codecs = CodecRegistry::new();
        codecs.register(PropertyCodec::<Note>::new(NOTE_TAG)).unwrap();

        let note = Note::new("ana", "hello", "body text");
        let payload = codecs.encode(&note).unwrap();
        assert_eq!(payload.type_tag, NOTE_TAG);

        let decoded = codecs.decode(&payload).unwrap();
        assert_eq!(decoded.downcast_ref::<Note>(), Some(&note));
    }
}
