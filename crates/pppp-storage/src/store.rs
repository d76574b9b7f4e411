//! Per-type replicated object store.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use pppp_protocol::{Change, Message, ObjectPayload, UpdateHint, Value};
use tracing::{debug, trace};

use crate::persist::same_properties;
use crate::{generate_hash, CodecRegistry, IdentityHash, Persist, Result, StorageError};

/// Receives the messages produced by loud store operations.
pub trait ReplicationSink: Send + Sync {
    /// Hands a message to every connected peer.
    fn replicate(&self, message: Message);
}

const SHARD_COUNT: usize = 16;

type Shard<T> = RwLock<HashMap<IdentityHash, T>>;

fn shard_index(hash: IdentityHash) -> usize {
    (hash.as_i64() as u64 % SHARD_COUNT as u64) as usize
}

/// A hash-indexed collection of `T`.
///
/// Loud operations replicate through the store's [`ReplicationSink`]; quiet
/// operations only touch local state. Entries are spread over independently
/// locked shards. Operations spanning several shards take the locks in
/// ascending shard order.
pub struct Store<T: Persist> {
    shards: Box<[Shard<T>]>,
    codecs: Arc<CodecRegistry>,
    sink: Option<Arc<dyn ReplicationSink>>,
}

impl<T: Persist> Store<T> {
    /// Creates a store that replicates loud operations into `sink`.
    #[must_use]
    pub fn new(codecs: Arc<CodecRegistry>, sink: Option<Arc<dyn ReplicationSink>>) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            shards,
            codecs,
            sink,
        }
    }

    /// Creates a store that never replicates.
    #[must_use]
    pub fn local() -> Self {
        Self::new(Arc::new(CodecRegistry::new()), None)
    }

    /// Codecs used to encode outgoing objects.
    #[must_use]
    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.codecs
    }

    /// Computes the hash under which `obj` would be stored.
    #[must_use]
    pub fn hash_of(&self, obj: &T) -> IdentityHash {
        generate_hash(obj)
    }

    fn shard(&self, hash: IdentityHash) -> &Shard<T> {
        &self.shards[shard_index(hash)]
    }

    /// Encodes `obj` for replication, or `None` when nothing would listen.
    fn outgoing(&self, obj: &T) -> Result<Option<(&Arc<dyn ReplicationSink>, ObjectPayload)>> {
        match &self.sink {
            Some(sink) => Ok(Some((sink, self.codecs.encode(obj)?))),
            None => Ok(None),
        }
    }

    fn emit(&self, message: Message) {
        if let Some(sink) = &self.sink {
            sink.replicate(message);
        }
    }

    /// Inserts `obj` and replicates it.
    ///
    /// Emits CREATION, or CHANGE with a whole-object hint when an entry with
    /// the same hash was replaced. Returns the replaced entry.
    pub fn insert(&self, obj: T) -> Result<Option<T>> {
        let hash = generate_hash(&obj);
        let outgoing = self.outgoing(&obj)?;

        let mut shard = self.shard(hash).write();
        let previous = shard.insert(hash, obj);
        if let Some((sink, object)) = outgoing {
            let message = if previous.is_some() {
                Message::Change(Change {
                    original_hash: hash.as_i64(),
                    object,
                    hint: UpdateHint::whole_object(),
                })
            } else {
                Message::Creation(object)
            };
            sink.replicate(message);
        }
        drop(shard);

        debug!(type_name = T::TYPE_NAME, %hash, replaced = previous.is_some(), "insert");
        Ok(previous)
    }

    /// Inserts `obj` without replicating. Returns the replaced entry.
    pub fn insert_quietly(&self, obj: T) -> Option<T> {
        let hash = generate_hash(&obj);
        let previous = self.shard(hash).write().insert(hash, obj);
        trace!(type_name = T::TYPE_NAME, %hash, replaced = previous.is_some(), "insert quietly");
        previous
    }

    /// Inserts `obj` quietly unless an identical entry is already stored.
    ///
    /// Returns true if local state changed.
    pub(crate) fn merge(&self, obj: T) -> bool {
        let hash = generate_hash(&obj);
        let mut shard = self.shard(hash).write();
        if let Some(existing) = shard.get(&hash) {
            if same_properties(existing, &obj) {
                return false;
            }
        }
        shard.insert(hash, obj);
        true
    }

    /// Replaces the entry at `original` with `obj` and replicates a CHANGE.
    ///
    /// Fails with [`StorageError::NotFound`] if no entry exists at
    /// `original`. Returns the replaced entry.
    pub fn update(&self, original: IdentityHash, obj: T, hint: UpdateHint) -> Result<T> {
        let outgoing = self.outgoing(&obj)?;
        let prior = self.relocate(original, obj, |_| {
            if let Some((sink, object)) = outgoing {
                sink.replicate(Message::Change(Change {
                    original_hash: original.as_i64(),
                    object,
                    hint,
                }));
            }
        })?;
        debug!(type_name = T::TYPE_NAME, hash = %original, "update");
        Ok(prior)
    }

    /// Replaces the entry at `original` with `obj` without replicating.
    pub fn update_quietly(&self, original: IdentityHash, obj: T) -> Result<T> {
        self.relocate(original, obj, |_| {})
    }

    /// Writes one property of the entry at `hash` and replicates a CHANGE
    /// hinted with that property.
    ///
    /// Writing an identity property moves the entry to its new hash. Fails
    /// with [`StorageError::UnknownProperty`] if `T` has no property called
    /// `name` and with [`StorageError::NotFound`] if nothing is stored at
    /// `hash`. Returns the updated object.
    pub fn set(&self, hash: IdentityHash, name: &str, value: Value) -> Result<T> {
        let property = T::property(name).ok_or_else(|| StorageError::UnknownProperty {
            type_name: T::TYPE_NAME,
            name: name.to_string(),
        })?;
        let hint = UpdateHint::new(property.kind(), property.name());

        let (_, updated) = self
            .swap_with(
                hash,
                |current| {
                    let mut next = current.clone();
                    property.set(&mut next, value.clone())?;
                    Ok(Some(next))
                },
                Some(&hint),
            )?
            .ok_or(StorageError::NotFound(hash))?;
        debug!(type_name = T::TYPE_NAME, %hash, property = name, "set");
        Ok(updated)
    }

    /// Quietly applies a CHANGE received from a peer.
    ///
    /// A hint naming a property of `T` copies only that property onto the
    /// local entry; any other hint replaces the whole entry. The merge runs
    /// against the entry as stored when the write lands, so concurrent local
    /// writes to other properties survive. An unknown `original` falls back
    /// to [`merge`](Self::merge). Returns true if local state changed.
    pub(crate) fn merge_change(
        &self,
        original: IdentityHash,
        received: T,
        hint: &UpdateHint,
    ) -> Result<bool> {
        let property = if hint.is_whole_object() {
            None
        } else {
            T::properties()
                .into_iter()
                .find(|p| p.name() == hint.property && p.kind() == hint.kind)
        };

        let swapped = self.swap_with(
            original,
            |current| {
                let merged = match property {
                    Some(property) => {
                        let mut merged = current.clone();
                        property.set(&mut merged, property.get(&received))?;
                        merged
                    }
                    None => received.clone(),
                };
                Ok((!same_properties(current, &merged)).then_some(merged))
            },
            None,
        );
        match swapped {
            Ok(swapped) => Ok(swapped.is_some()),
            Err(StorageError::NotFound(_)) => {
                trace!(
                    type_name = T::TYPE_NAME,
                    hash = %original,
                    "change for unknown entry, inserting"
                );
                Ok(self.merge(received))
            }
            Err(e) => Err(e),
        }
    }

    /// Replaces the entry at `original` with `next(current)`.
    ///
    /// The write only lands if the entry still equals the copy `next` saw;
    /// otherwise `next` runs again on the fresh entry. `next` returning
    /// `None` leaves the entry untouched. With a `hint`, the write is
    /// replicated as a CHANGE. Returns the replaced and the written entry.
    fn swap_with(
        &self,
        original: IdentityHash,
        mut next: impl FnMut(&T) -> Result<Option<T>>,
        hint: Option<&UpdateHint>,
    ) -> Result<Option<(T, T)>> {
        loop {
            let current = self.get(original).ok_or(StorageError::NotFound(original))?;
            let Some(updated) = next(&current)? else {
                return Ok(None);
            };
            let outgoing = match hint {
                Some(hint) => self.outgoing(&updated)?.map(|out| (out, hint.clone())),
                None => None,
            };
            let applied = self.try_relocate(original, updated.clone(), Some(&current), |_| {
                if let Some(((sink, object), hint)) = outgoing {
                    sink.replicate(Message::Change(Change {
                        original_hash: original.as_i64(),
                        object,
                        hint,
                    }));
                }
            })?;
            match applied {
                Some(prior) => return Ok(Some((prior, updated))),
                None => trace!(
                    type_name = T::TYPE_NAME,
                    hash = %original,
                    "entry changed concurrently, retrying"
                ),
            }
        }
    }

    /// Moves the entry at `original` to the hash of `obj`.
    ///
    /// `on_applied` runs with the new hash while the affected shards are
    /// still locked.
    fn relocate(
        &self,
        original: IdentityHash,
        obj: T,
        on_applied: impl FnOnce(IdentityHash),
    ) -> Result<T> {
        self.try_relocate(original, obj, None, on_applied)?
            .ok_or(StorageError::NotFound(original))
    }

    /// Like [`relocate`](Self::relocate), but when `expected` is given the
    /// move only happens if the stored entry still equals it. Returns `None`
    /// when the entry changed in the meantime.
    fn try_relocate(
        &self,
        original: IdentityHash,
        obj: T,
        expected: Option<&T>,
        on_applied: impl FnOnce(IdentityHash),
    ) -> Result<Option<T>> {
        let hash = generate_hash(&obj);
        let (from, to) = (shard_index(original), shard_index(hash));
        let stale = |stored: &T| expected.is_some_and(|e| !same_properties(stored, e));

        if from == to {
            let mut shard = self.shards[from].write();
            let stored = shard
                .get(&original)
                .ok_or(StorageError::NotFound(original))?;
            if stale(stored) {
                return Ok(None);
            }
            let prior = shard
                .remove(&original)
                .ok_or(StorageError::NotFound(original))?;
            shard.insert(hash, obj);
            on_applied(hash);
            return Ok(Some(prior));
        }

        let (low, high) = (from.min(to), from.max(to));
        let mut low_guard = self.shards[low].write();
        let mut high_guard = self.shards[high].write();
        let (source, target) = if from < to {
            (&mut *low_guard, &mut *high_guard)
        } else {
            (&mut *high_guard, &mut *low_guard)
        };
        let stored = source
            .get(&original)
            .ok_or(StorageError::NotFound(original))?;
        if stale(stored) {
            return Ok(None);
        }
        let prior = source
            .remove(&original)
            .ok_or(StorageError::NotFound(original))?;
        target.insert(hash, obj);
        on_applied(hash);
        Ok(Some(prior))
    }

    /// Removes `obj` and replicates a REMOVAL. Returns true if it existed.
    pub fn remove(&self, obj: &T) -> bool {
        self.remove_hash(generate_hash(obj))
    }

    /// Removes the entry at `hash` and replicates a REMOVAL.
    ///
    /// The REMOVAL is sent even when nothing was stored locally, since a
    /// peer may still hold the entry. Returns true if it existed.
    pub fn remove_hash(&self, hash: IdentityHash) -> bool {
        let mut shard = self.shard(hash).write();
        let existed = shard.remove(&hash).is_some();
        self.emit(Message::Removal(hash.as_i64()));
        drop(shard);

        debug!(type_name = T::TYPE_NAME, %hash, existed, "remove");
        existed
    }

    /// Removes `obj` without replicating.
    pub fn remove_quietly(&self, obj: &T) -> bool {
        self.remove_hash_quietly(generate_hash(obj))
    }

    /// Removes the entry at `hash` without replicating.
    pub fn remove_hash_quietly(&self, hash: IdentityHash) -> bool {
        self.shard(hash).write().remove(&hash).is_some()
    }

    /// Removes every entry, replicating one REMOVAL per entry.
    pub fn clear(&self) {
        let mut guards: Vec<_> = self.shards.iter().map(|s| s.write()).collect();
        let mut removed = 0usize;
        for guard in &mut guards {
            for (hash, _) in guard.drain() {
                self.emit(Message::Removal(hash.as_i64()));
                removed += 1;
            }
        }
        drop(guards);
        debug!(type_name = T::TYPE_NAME, removed, "clear");
    }

    /// Removes every entry without replicating.
    pub fn clear_quietly(&self) {
        let mut guards: Vec<_> = self.shards.iter().map(|s| s.write()).collect();
        for guard in &mut guards {
            guard.clear();
        }
    }

    /// Returns a copy of the entry at `hash`.
    #[must_use]
    pub fn get(&self, hash: IdentityHash) -> Option<T> {
        self.shard(hash).read().get(&hash).cloned()
    }

    /// Returns true if an entry with the hash of `obj` exists.
    #[must_use]
    pub fn contains(&self, obj: &T) -> bool {
        self.contains_hash(generate_hash(obj))
    }

    /// Returns true if an entry exists at `hash`.
    #[must_use]
    pub fn contains_hash(&self, hash: IdentityHash) -> bool {
        self.shard(hash).read().contains_key(&hash)
    }

    /// Number of entries.
    #[must_use]
    pub fn size(&self) -> usize {
        let guards: Vec<_> = self.shards.iter().map(|s| s.read()).collect();
        guards.iter().map(|g| g.len()).sum()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.size()
    }

    /// Returns true if the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Point-in-time copy of every entry, ordered by hash.
    #[must_use]
    pub fn entries(&self) -> Vec<(IdentityHash, T)> {
        let guards: Vec<_> = self.shards.iter().map(|s| s.read()).collect();
        let mut entries: Vec<_> = guards
            .iter()
            .flat_map(|g| g.iter().map(|(h, v)| (*h, v.clone())))
            .collect();
        drop(guards);
        entries.sort_by_key(|(hash, _)| *hash);
        entries
    }

    /// Point-in-time copy of every object, ordered by hash.
    #[must_use]
    pub fn collect(&self) -> Vec<T> {
        self.entries().into_iter().map(|(_, v)| v).collect()
    }

    /// Iterates over a snapshot taken when the call is made.
    pub fn iter(&self) -> std::vec::IntoIter<T> {
        self.collect().into_iter()
    }
}

impl<'a, T: Persist> IntoIterator for &'a Store<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T: Persist> fmt::Debug for Store<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("type_name", &T::TYPE_NAME)
            .field("size", &self.size())
            .field("replicating", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::persist::fixtures::Task;
    use crate::PropertyCodec;
    use pppp_protocol::ValueKind;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) messages: parking_lot::Mutex<Vec<Message>>,
    }

    impl RecordingSink {
        pub(crate) fn take(&self) -> Vec<Message> {
            std::mem::take(&mut *self.messages.lock())
        }
    }

    impl ReplicationSink for RecordingSink {
        fn replicate(&self, message: Message) {
            self.messages.lock().push(message);
        }
    }

    pub(crate) fn replicating_store() -> (Store<Task>, Arc<RecordingSink>) {
        let mut codecs = CodecRegistry::new();
        codecs.register(PropertyCodec::<Task>::new(1)).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let store = Store::new(Arc::new(codecs), Some(sink.clone() as Arc<dyn ReplicationSink>));
        (store, sink)
    }

    #[test]
    fn insert_and_get() {
        let store = Store::<Task>::local();
        let task = Task::new("ana", "ship it");
        let hash = store.hash_of(&task);

        assert_eq!(store.insert(task.clone()).unwrap(), None);
        assert_eq!(store.get(hash), Some(task.clone()));
        assert!(store.contains(&task));
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn colliding_insert_returns_previous() {
        let store = Store::<Task>::local();
        let first = Task::new("ana", "ship it");
        let mut second = first.clone();
        second.done = true;

        store.insert_quietly(first.clone());
        assert_eq!(store.insert_quietly(second.clone()), Some(first));
        assert_eq!(store.size(), 1);
        assert_eq!(store.get(store.hash_of(&second)), Some(second));
    }

    #[test]
    fn loud_insert_emits_creation_then_change() {
        let (store, sink) = replicating_store();
        let task = Task::new("ana", "ship it");

        store.insert(task.clone()).unwrap();
        store.insert(task.clone()).unwrap();

        let messages = sink.take();
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], Message::Creation(ref o) if o.type_tag == 1));
        match &messages[1] {
            Message::Change(change) => {
                assert_eq!(change.original_hash, store.hash_of(&task).as_i64());
                assert!(change.hint.is_whole_object());
            }
            other => panic!("expected CHANGE, got {other:?}"),
        }
    }

    #[test]
    fn quiet_operations_never_emit() {
        let (store, sink) = replicating_store();
        let task = Task::new("ana", "ship it");
        let hash = store.hash_of(&task);

        store.insert_quietly(task.clone());
        store.update_quietly(hash, task.clone()).unwrap();
        store.remove_hash_quietly(hash);
        store.insert_quietly(task);
        store.clear_quietly();

        assert!(sink.take().is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn update_missing_hash_is_not_found() {
        let (store, sink) = replicating_store();
        store.insert_quietly(Task::new("ana", "one"));
        let missing = IdentityHash::from_i64(12345);

        let result = store.update(
            missing,
            Task::new("ana", "two"),
            UpdateHint::new(ValueKind::Text, "title"),
        );
        assert!(matches!(result, Err(StorageError::NotFound(h)) if h == missing));
        assert_eq!(store.size(), 1);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn update_rehashes_and_emits_change() {
        let (store, sink) = replicating_store();
        let before = Task::new("ana", "draft");
        let original = store.hash_of(&before);
        store.insert_quietly(before.clone());

        let after = Task::new("ana", "final");
        let hint = UpdateHint::new(ValueKind::Text, "title");
        let prior = store.update(original, after.clone(), hint.clone()).unwrap();

        assert_eq!(prior, before);
        assert!(!store.contains_hash(original));
        assert_eq!(store.get(store.hash_of(&after)), Some(after));
        assert_eq!(store.size(), 1);

        match sink.take().as_slice() {
            [Message::Change(change)] => {
                assert_eq!(change.original_hash, original.as_i64());
                assert_eq!(change.hint, hint);
            }
            other => panic!("expected one CHANGE, got {other:?}"),
        }
    }

    #[test]
    fn removal_is_emitted_even_when_absent() {
        let (store, sink) = replicating_store();
        assert!(!store.remove_hash(IdentityHash::from_i64(9)));
        assert_eq!(sink.take(), vec![Message::Removal(9)]);
    }

    #[test]
    fn clear_emits_one_removal_per_entry() {
        let (store, sink) = replicating_store();
        for title in ["a", "b", "c"] {
            store.insert_quietly(Task::new("ana", title));
        }
        store.clear();

        let messages = sink.take();
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| matches!(m, Message::Removal(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn iteration_is_a_snapshot() {
        let store = Store::<Task>::local();
        store.insert_quietly(Task::new("ana", "a"));
        store.insert_quietly(Task::new("ana", "b"));

        let mut seen = 0;
        for task in &store {
            store.insert_quietly(Task::new("bo", &task.title));
            seen += 1;
        }
        assert_eq!(seen, 2);
        assert_eq!(store.size(), 4);
    }

    #[test]
    fn collect_is_ordered_by_hash() {
        let store = Store::<Task>::local();
        for title in ["x", "y", "z", "w"] {
            store.insert_quietly(Task::new("ana", title));
        }
        let hashes: Vec<_> = store.entries().into_iter().map(|(h, _)| h).collect();
        let mut sorted = hashes.clone();
        sorted.sort();
        assert_eq!(hashes, sorted);
    }

    #[test]
    fn loud_insert_without_codec_fails_before_mutating() {
        let sink: Arc<dyn ReplicationSink> = Arc::new(RecordingSink::default());
        let store = Store::<Task>::new(Arc::new(CodecRegistry::new()), Some(sink));
        assert!(matches!(
            store.insert(Task::new("ana", "x")),
            Err(StorageError::NoCodec(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn set_derives_the_hint_from_the_property() {
        let (store, sink) = replicating_store();
        let task = Task::new("ana", "ship");
        let hash = store.hash_of(&task);
        store.insert_quietly(task);

        let updated = store.set(hash, "done", Value::Bool(true)).unwrap();
        assert!(updated.done);
        assert_eq!(store.get(hash), Some(updated));

        match sink.take().as_slice() {
            [Message::Change(change)] => {
                assert_eq!(change.original_hash, hash.as_i64());
                assert_eq!(change.hint, UpdateHint::new(ValueKind::Bool, "done"));
            }
            other => panic!("expected one CHANGE, got {other:?}"),
        }
    }

    #[test]
    fn set_rejects_unknown_properties_and_bad_values() {
        let (store, sink) = replicating_store();
        let task = Task::new("ana", "ship");
        let hash = store.hash_of(&task);
        store.insert_quietly(task.clone());

        assert!(matches!(
            store.set(hash, "priority", Value::Int(1)),
            Err(StorageError::UnknownProperty { type_name: "Task", ref name }) if name == "priority"
        ));
        assert!(matches!(
            store.set(hash, "done", Value::from("yes")),
            Err(StorageError::Protocol(_))
        ));
        assert!(matches!(
            store.set(IdentityHash::from_i64(3), "done", Value::Bool(true)),
            Err(StorageError::NotFound(_))
        ));
        assert_eq!(store.get(hash), Some(task));
        assert!(sink.take().is_empty());
    }

    #[test]
    fn merge_change_keeps_local_writes_to_other_properties() {
        let (store, _) = replicating_store();
        let task = Task::new("ana", "ship");
        let hash = store.hash_of(&task);
        store.insert_quietly(task.clone());
        store.set(hash, "done", Value::Bool(true)).unwrap();

        // A stale copy hinted on `title` only moves the entry.
        let mut received = task;
        received.title = "shipped".to_string();
        let hint = UpdateHint::new(ValueKind::Text, "title");
        assert!(store.merge_change(hash, received, &hint).unwrap());

        let moved = store.get(store.hash_of(&Task::new("ana", "shipped"))).unwrap();
        assert!(moved.done);
    }
}
