//! Type-erased access to stores for routing inbound replication.

use std::any::{Any, TypeId};
use std::sync::Arc;

use pppp_protocol::{ObjectPayload, UpdateHint};

use crate::codec::AnyObject;
use crate::{IdentityHash, Persist, Result, Store, StorageError};

/// Operations the node needs on a store without knowing its type.
///
/// Every `apply_*` method is quiet and reports whether local state changed.
pub trait AnyStore: Send + Sync {
    /// The stored type.
    fn object_type(&self) -> TypeId;

    /// Name of the stored type.
    fn type_name(&self) -> &'static str;

    /// Returns true if an entry exists at `hash`.
    fn contains_hash(&self, hash: IdentityHash) -> bool;

    /// Number of entries.
    fn len(&self) -> usize;

    /// Returns true if the store holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies a received CREATION or INITIALIZE entry.
    fn apply_insert(&self, object: AnyObject) -> Result<bool>;

    /// Applies a received CHANGE.
    ///
    /// A hint naming a known property copies only that property onto the
    /// local entry. If `original` is not stored locally, the object is
    /// inserted instead.
    fn apply_change(
        &self,
        original: IdentityHash,
        object: AnyObject,
        hint: &UpdateHint,
    ) -> Result<bool>;

    /// Applies a received REMOVAL.
    fn apply_removal(&self, hash: IdentityHash) -> bool;

    /// Encodes every entry for an INITIALIZE snapshot.
    fn snapshot(&self) -> Result<Vec<ObjectPayload>>;

    /// Removes every entry without replicating.
    fn clear_quietly(&self);

    /// Converts into a shared [`Any`] for downcasting to the typed store.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Persist> Store<T> {
    fn downcast(object: AnyObject) -> Result<T> {
        object
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| StorageError::TypeMismatch(T::TYPE_NAME))
    }
}

impl<T: Persist> AnyStore for Store<T> {
    fn object_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn contains_hash(&self, hash: IdentityHash) -> bool {
        Store::contains_hash(self, hash)
    }

    fn len(&self) -> usize {
        self.size()
    }

    fn apply_insert(&self, object: AnyObject) -> Result<bool> {
        Ok(self.merge(Self::downcast(object)?))
    }

    fn apply_change(
        &self,
        original: IdentityHash,
        object: AnyObject,
        hint: &UpdateHint,
    ) -> Result<bool> {
        self.merge_change(original, Self::downcast(object)?, hint)
    }

    fn apply_removal(&self, hash: IdentityHash) -> bool {
        self.remove_hash_quietly(hash)
    }

    fn snapshot(&self) -> Result<Vec<ObjectPayload>> {
        self.collect()
            .iter()
            .map(|obj| self.codecs().encode(obj))
            .collect()
    }

    fn clear_quietly(&self) {
        Store::clear_quietly(self);
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
