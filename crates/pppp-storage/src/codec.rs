//! Type-tagged object codecs.

use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use pppp_protocol::{Metadata, ObjectPayload, Value};
use tracing::debug;

use crate::{Persist, Result, StorageError};

/// A decoded object of some registered type.
pub type AnyObject = Box<dyn Any + Send + Sync>;

/// Serializer for one persisted type, identified on the wire by a type tag.
pub trait Codec: Send + Sync + 'static {
    /// Tag written in front of every object this codec produces.
    fn type_tag(&self) -> u8;

    /// The type this codec reads and writes.
    fn accepts(&self) -> TypeId;

    /// Human readable name of the accepted type.
    fn type_name(&self) -> &'static str;

    /// A strict codec matches only [`Codec::accepts`].
    fn is_strict(&self) -> bool {
        false
    }

    /// Further types a non-strict codec is willing to write.
    fn compatible(&self) -> &[TypeId] {
        &[]
    }

    /// Whether this codec can write objects of type `ty`.
    fn can_accept(&self, ty: TypeId) -> bool {
        ty == self.accepts() || (!self.is_strict() && self.compatible().contains(&ty))
    }

    /// Encodes `obj`.
    fn write_to_bytes(&self, obj: &dyn Any) -> Result<Vec<u8>>;

    /// Decodes an object previously produced by [`Codec::write_to_bytes`].
    fn read_from_bytes(&self, data: &[u8]) -> Result<AnyObject>;
}

/// Ordered set of codecs with unique type tags.
#[derive(Default, Clone)]
pub struct CodecRegistry {
    codecs: Vec<Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a codec. Its type tag must not already be in use.
    pub fn register(&mut self, codec: impl Codec) -> Result<()> {
        self.register_arc(Arc::new(codec))
    }

    /// Registers a shared codec. Its type tag must not already be in use.
    pub fn register_arc(&mut self, codec: Arc<dyn Codec>) -> Result<()> {
        let tag = codec.type_tag();
        if self.by_tag(tag).is_some() {
            return Err(StorageError::DuplicateTag(tag));
        }
        debug!(tag, type_name = codec.type_name(), "registered codec");
        self.codecs.push(codec);
        Ok(())
    }

    /// Finds the codec for a type tag.
    #[must_use]
    pub fn by_tag(&self, tag: u8) -> Option<&Arc<dyn Codec>> {
        self.codecs.iter().find(|c| c.type_tag() == tag)
    }

    /// Finds the first registered codec that can write `ty`.
    #[must_use]
    pub fn for_type(&self, ty: TypeId) -> Option<&Arc<dyn Codec>> {
        self.codecs.iter().find(|c| c.can_accept(ty))
    }

    /// Encodes `obj` with the first codec that accepts its type.
    pub fn encode<T: Any>(&self, obj: &T) -> Result<ObjectPayload> {
        let codec = self
            .for_type(TypeId::of::<T>())
            .ok_or(StorageError::NoCodec(std::any::type_name::<T>()))?;
        let data = codec.write_to_bytes(obj)?;
        Ok(ObjectPayload::new(codec.type_tag(), data))
    }

    /// Decodes a payload with the codec named by its type tag.
    pub fn decode(&self, payload: &ObjectPayload) -> Result<AnyObject> {
        let codec = self
            .by_tag(payload.type_tag)
            .ok_or(StorageError::UnknownTypeTag(payload.type_tag))?;
        codec.read_from_bytes(&payload.data)
    }

    /// Number of registered codecs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    /// Returns true if no codec is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.codecs.iter().map(|c| (c.type_tag(), c.type_name())))
            .finish()
    }
}

/// Codec for any [`Persist`] type, built from its property list.
///
/// Objects are written as a [`Value::Map`] of every property. Reading starts
/// from `T::default()` and applies the setters of the properties present, so
/// unknown names are skipped and missing ones keep their default.
pub struct PropertyCodec<T> {
    tag: u8,
    strict: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Persist> PropertyCodec<T> {
    /// Creates a non-strict codec with the given type tag.
    #[must_use]
    pub fn new(tag: u8) -> Self {
        Self {
            tag,
            strict: false,
            _marker: PhantomData,
        }
    }

    /// Makes the codec match only `T`.
    #[must_use]
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    fn to_value(obj: &T) -> Value {
        let map: Metadata = T::properties()
            .iter()
            .map(|p| (p.name().to_string(), p.get(obj)))
            .collect();
        Value::Map(map)
    }
}

impl<T: Persist> Codec for PropertyCodec<T> {
    fn type_tag(&self) -> u8 {
        self.tag
    }

    fn accepts(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn is_strict(&self) -> bool {
        self.strict
    }

    fn write_to_bytes(&self, obj: &dyn Any) -> Result<Vec<u8>> {
        let obj = obj
            .downcast_ref::<T>()
            .ok_or(StorageError::TypeMismatch(T::TYPE_NAME))?;
        Ok(Self::to_value(obj).to_bytes().to_vec())
    }

    fn read_from_bytes(&self, data: &[u8]) -> Result<AnyObject> {
        let Value::Map(mut fields) = Value::from_bytes(data)? else {
            return Err(StorageError::TypeMismatch(T::TYPE_NAME));
        };
        let mut obj = T::default();
        for property in T::properties() {
            if let Some(value) = fields.remove(property.name()) {
                property.set(&mut obj, value)?;
            }
        }
        Ok(Box::new(obj))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::fixtures::Task;
    use pretty_assertions::assert_eq;

    fn registry() -> CodecRegistry {
        let mut codecs = CodecRegistry::new();
        codecs.register(PropertyCodec::<Task>::new(7)).unwrap();
        codecs
    }

    #[test]
    fn property_codec_roundtrip() {
        let codecs = registry();
        let mut task = Task::new("ana", "ship it");
        task.done = true;

        let payload = codecs.encode(&task).unwrap();
        assert_eq!(payload.type_tag, 7);

        let decoded = codecs.decode(&payload).unwrap();
        assert_eq!(*decoded.downcast::<Task>().unwrap(), task);
    }

    #[test]
    fn duplicate_tag_rejected() {
        let mut codecs = registry();
        assert!(matches!(
            codecs.register(PropertyCodec::<Task>::new(7)),
            Err(StorageError::DuplicateTag(7))
        ));
        assert_eq!(codecs.len(), 1);
    }

    #[test]
    fn unknown_tag_and_type() {
        let codecs = registry();
        assert!(matches!(
            codecs.decode(&ObjectPayload::new(9, Vec::new())),
            Err(StorageError::UnknownTypeTag(9))
        ));
        assert!(matches!(
            codecs.encode(&42u32),
            Err(StorageError::NoCodec(_))
        ));
    }

    #[test]
    fn unknown_properties_are_skipped() {
        let mut fields = Metadata::new();
        fields.insert("title".to_string(), Value::from("ship it"));
        fields.insert("priority".to_string(), Value::Int(3));
        let data = Value::Map(fields).to_bytes();

        let decoded = PropertyCodec::<Task>::new(1).read_from_bytes(&data).unwrap();
        let task = decoded.downcast::<Task>().unwrap();
        assert_eq!(task.title, "ship it");
        assert_eq!(task.owner, "");
    }

    #[test]
    fn non_map_payload_rejected() {
        let data = Value::Int(1).to_bytes();
        assert!(PropertyCodec::<Task>::new(1).read_from_bytes(&data).is_err());
    }

    struct Legacy;

    #[test]
    fn strictness_controls_compatible_types() {
        struct Widened {
            inner: PropertyCodec<Task>,
        }

        impl Codec for Widened {
            fn type_tag(&self) -> u8 {
                self.inner.type_tag()
            }
            fn accepts(&self) -> TypeId {
                self.inner.accepts()
            }
            fn type_name(&self) -> &'static str {
                self.inner.type_name()
            }
            fn is_strict(&self) -> bool {
                self.inner.is_strict()
            }
            fn compatible(&self) -> &[TypeId] {
                static COMPATIBLE: std::sync::OnceLock<[TypeId; 1]> = std::sync::OnceLock::new();
                COMPATIBLE.get_or_init(|| [TypeId::of::<Legacy>()])
            }
            fn write_to_bytes(&self, obj: &dyn Any) -> Result<Vec<u8>> {
                self.inner.write_to_bytes(obj)
            }
            fn read_from_bytes(&self, data: &[u8]) -> Result<AnyObject> {
                self.inner.read_from_bytes(data)
            }
        }

        let loose = Widened {
            inner: PropertyCodec::new(1),
        };
        assert!(loose.can_accept(TypeId::of::<Task>()));
        assert!(loose.can_accept(TypeId::of::<Legacy>()));

        let strict = Widened {
            inner: PropertyCodec::new(1).strict(),
        };
        assert!(strict.can_accept(TypeId::of::<Task>()));
        assert!(!strict.can_accept(TypeId::of::<Legacy>()));
    }

    #[test]
    fn first_registered_codec_wins() {
        let mut codecs = CodecRegistry::new();
        codecs.register(PropertyCodec::<Task>::new(3)).unwrap();
        codecs.register(PropertyCodec::<Task>::new(4)).unwrap();
        let payload = codecs.encode(&Task::new("ana", "ship")).unwrap();
        assert_eq!(payload.type_tag, 3);
    }
}
