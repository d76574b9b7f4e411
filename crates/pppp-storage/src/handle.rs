//! Handles that turn property writes into replicated updates.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use pppp_protocol::Value;

use crate::{generate_hash, IdentityHash, Persist, Result, Store};

/// A stored object addressed through its store.
///
/// Every [`set`](Self::set) goes through [`Store::set`], so the peers receive
/// a CHANGE hinted with the written property. The handle follows the entry
/// when an identity property moves it to a new hash.
pub struct Persisted<T: Persist> {
    store: Arc<Store<T>>,
    hash: Mutex<IdentityHash>,
}

impl<T: Persist> Persisted<T> {
    /// Loudly inserts `obj` into `store` and returns a handle to it.
    pub fn insert(store: Arc<Store<T>>, obj: T) -> Result<Self> {
        let hash = generate_hash(&obj);
        store.insert(obj)?;
        Ok(Self::attach(store, hash))
    }

    /// A handle to whatever is stored at `hash`.
    #[must_use]
    pub fn attach(store: Arc<Store<T>>, hash: IdentityHash) -> Self {
        Self {
            store,
            hash: Mutex::new(hash),
        }
    }

    /// Current identity hash of the entry.
    #[must_use]
    pub fn hash(&self) -> IdentityHash {
        *self.hash.lock()
    }

    /// Copy of the entry, or `None` once it was removed.
    #[must_use]
    pub fn get(&self) -> Option<T> {
        self.store.get(self.hash())
    }

    /// Writes one property and replicates the change.
    pub fn set(&self, name: &str, value: Value) -> Result<T> {
        let mut hash = self.hash.lock();
        let updated = self.store.set(*hash, name, value)?;
        *hash = generate_hash(&updated);
        Ok(updated)
    }

    /// Loudly removes the entry. Returns true if it was still stored.
    pub fn unpersist(self) -> bool {
        self.store.remove_hash(self.hash())
    }

    /// The store holding the entry.
    #[must_use]
    pub fn store(&self) -> &Arc<Store<T>> {
        &self.store
    }
}

impl<T: Persist> fmt::Debug for Persisted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persisted")
            .field("type_name", &T::TYPE_NAME)
            .field("hash", &self.hash())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::fixtures::Task;
    use crate::store::tests::replicating_store;
    use crate::StorageError;
    use pppp_protocol::{Message, ValueKind};
    use pretty_assertions::assert_eq;

    #[test]
    fn set_follows_identity_changes() {
        let (store, sink) = replicating_store();
        let store = Arc::new(store);
        let task = Persisted::insert(store.clone(), Task::new("ana", "draft")).unwrap();
        let original = task.hash();
        sink.take();

        let renamed = task.set("title", Value::from("final")).unwrap();
        assert_eq!(renamed.title, "final");
        assert_eq!(task.hash(), store.hash_of(&renamed));
        assert!(!store.contains_hash(original));

        task.set("done", Value::Bool(true)).unwrap();
        assert_eq!(task.get().map(|t| t.done), Some(true));

        match sink.take().as_slice() {
            [Message::Change(rename), Message::Change(done)] => {
                assert_eq!(rename.original_hash, original.as_i64());
                assert_eq!(rename.hint.kind, ValueKind::Text);
                assert_eq!(rename.hint.property, "title");
                assert_eq!(done.original_hash, task.hash().as_i64());
                assert_eq!(done.hint.property, "done");
            }
            other => panic!("expected two CHANGE messages, got {other:?}"),
        }
    }

    #[test]
    fn unpersist_replicates_removal() {
        let (store, sink) = replicating_store();
        let task = Persisted::insert(Arc::new(store), Task::new("ana", "ship")).unwrap();
        let hash = task.hash();
        let store = task.store().clone();
        sink.take();

        assert!(task.unpersist());
        assert!(store.is_empty());
        assert_eq!(sink.take(), vec![Message::Removal(hash.as_i64())]);
    }

    #[test]
    fn set_on_removed_entry_is_not_found() {
        let (store, _) = replicating_store();
        let store = Arc::new(store);
        let task = Persisted::insert(store.clone(), Task::new("ana", "ship")).unwrap();
        store.clear_quietly();

        assert!(matches!(
            task.set("done", Value::Bool(true)),
            Err(StorageError::NotFound(_))
        ));
        assert_eq!(task.get(), None);
    }
}
