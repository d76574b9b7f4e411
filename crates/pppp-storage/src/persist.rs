//! Property accessors for persisted types.
//!
//! A persisted type lists its properties once; identity hashing, the
//! property codec and partial updates all work from that list.

use pppp_protocol::{Value, ValueKind};

/// Reads a property out of an object.
pub type Getter<T> = fn(&T) -> Value;

/// Writes a property into an object.
pub type Setter<T> = fn(&mut T, Value) -> pppp_protocol::Result<()>;

/// A named accessor pair for one property of `T`.
pub struct Property<T> {
    name: &'static str,
    kind: ValueKind,
    identity: bool,
    get: Getter<T>,
    set: Setter<T>,
}

impl<T> Property<T> {
    /// A property that participates in the identity hash.
    #[must_use]
    pub const fn identity(
        name: &'static str,
        kind: ValueKind,
        get: Getter<T>,
        set: Setter<T>,
    ) -> Self {
        Self {
            name,
            kind,
            identity: true,
            get,
            set,
        }
    }

    /// A property that is replicated but not hashed.
    #[must_use]
    pub const fn data(
        name: &'static str,
        kind: ValueKind,
        get: Getter<T>,
        set: Setter<T>,
    ) -> Self {
        Self {
            name,
            kind,
            identity: false,
            get,
            set,
        }
    }

    /// Property name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Declared value kind.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Whether the property feeds the identity hash.
    #[must_use]
    pub const fn is_identity(&self) -> bool {
        self.identity
    }

    /// Reads the property from `obj`.
    pub fn get(&self, obj: &T) -> Value {
        (self.get)(obj)
    }

    /// Writes `value` into `obj`.
    pub fn set(&self, obj: &mut T, value: Value) -> pppp_protocol::Result<()> {
        (self.set)(obj, value)
    }
}

impl<T> Clone for Property<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Property<T> {}

impl<T> std::fmt::Debug for Property<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Property")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("identity", &self.identity)
            .finish()
    }
}

/// A type that can live in a [`Store`](crate::Store) and be replicated.
///
/// ```
/// use pppp_protocol::{Value, ValueKind};
/// use pppp_storage::{Persist, Property};
///
/// #[derive(Debug, Clone, Default, PartialEq)]
/// struct Note {
///     title: String,
///     body: String,
/// }
///
/// impl Persist for Note {
///     const TYPE_NAME: &'static str = "Note";
///
///     fn properties() -> Vec<Property<Self>> {
///         vec![
///             Property::identity(
///                 "title",
///                 ValueKind::Text,
///                 |n: &Note| Value::from(n.title.as_str()),
///                 |n: &mut Note, v| {
///                     n.title = v.try_into()?;
///                     Ok(())
///                 },
///             ),
///             Property::data(
///                 "body",
///                 ValueKind::Text,
///                 |n: &Note| Value::from(n.body.as_str()),
///                 |n: &mut Note, v| {
///                     n.body = v.try_into()?;
///                     Ok(())
///                 },
///             ),
///         ]
///     }
/// }
/// ```
pub trait Persist: Default + Clone + Send + Sync + 'static {
    /// Stable name of the type, mixed into the identity hash.
    const TYPE_NAME: &'static str;

    /// All replicated properties of the type.
    fn properties() -> Vec<Property<Self>>;

    /// Looks up a property by name.
    fn property(name: &str) -> Option<Property<Self>> {
        Self::properties().into_iter().find(|p| p.name() == name)
    }
}

/// Returns true if every property of `a` equals the same property of `b`.
pub(crate) fn same_properties<T: Persist>(a: &T, b: &T) -> bool {
    T::properties().iter().all(|p| p.get(a) == p.get(b))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Test type with two identity properties and one data property.
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct Task {
        pub owner: String,
        pub title: String,
        pub done: bool,
    }

    impl Task {
        pub fn new(owner: &str, title: &str) -> Self {
            Self {
                owner: owner.to_string(),
                title: title.to_string(),
                done: false,
            }
        }
    }

    impl Persist for Task {
        const TYPE_NAME: &'static str = "Task";

        fn properties() -> Vec<Property<Self>> {
            vec![
                Property::identity(
                    "title",
                    ValueKind::Text,
                    |t: &Task| Value::from(t.title.as_str()),
                    |t: &mut Task, v| {
                        t.title = v.try_into()?;
                        Ok(())
                    },
                ),
                Property::identity(
                    "owner",
                    ValueKind::Text,
                    |t: &Task| Value::from(t.owner.as_str()),
                    |t: &mut Task, v| {
                        t.owner = v.try_into()?;
                        Ok(())
                    },
                ),
                Property::data(
                    "done",
                    ValueKind::Bool,
                    |t: &Task| Value::Bool(t.done),
                    |t: &mut Task, v| {
                        t.done = v.try_into()?;
                        Ok(())
                    },
                ),
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::Task;
    use super::*;

    #[test]
    fn property_lookup_by_name() {
        let done = Task::property("done").unwrap();
        assert_eq!(done.kind(), ValueKind::Bool);
        assert!(!done.is_identity());
        assert!(Task::property("missing").is_none());
    }

    #[test]
    fn setter_rejects_wrong_kind() {
        let mut task = Task::default();
        let title = Task::property("title").unwrap();
        assert!(title.set(&mut task, Value::Int(1)).is_err());
        title.set(&mut task, Value::from("write docs")).unwrap();
        assert_eq!(task.title, "write docs");
    }

    #[test]
    fn same_properties_compares_all_fields() {
        let a = Task::new("ana", "ship");
        let mut b = a.clone();
        assert!(same_properties(&a, &b));
        b.done = true;
        assert!(!same_properties(&a, &b));
    }
}
