//! Result wrapper that keeps failure separate from value presence.

/// Either a failure, or a success that may or may not carry a value.
///
/// `Succeeded(None)` is a success without a value and is never treated as a
/// failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailableValue<T> {
    /// The operation failed.
    Failed,
    /// The operation succeeded, optionally producing a value.
    Succeeded(Option<T>),
}

impl<T> FailableValue<T> {
    /// A failure.
    #[must_use]
    pub const fn failed() -> Self {
        Self::Failed
    }

    /// A success carrying `value`.
    #[must_use]
    pub const fn succeeded(value: Option<T>) -> Self {
        Self::Succeeded(value)
    }

    /// A success without a value.
    #[must_use]
    pub const fn empty() -> Self {
        Self::Succeeded(None)
    }

    /// Returns true if this is a failure.
    #[must_use]
    pub const fn did_fail(&self) -> bool {
        matches!(self, Self::Failed)
    }

    /// Returns the carried value, if the operation succeeded with one.
    #[must_use]
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Succeeded(value) => value.as_ref(),
            Self::Failed => None,
        }
    }

    /// Consumes the wrapper, returning the carried value.
    #[must_use]
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Succeeded(value) => value,
            Self::Failed => None,
        }
    }
}

impl<T> From<Option<T>> for FailableValue<T> {
    fn from(value: Option<T>) -> Self {
        Self::Succeeded(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_success_is_not_failure() {
        let v: FailableValue<u8> = FailableValue::empty();
        assert!(!v.did_fail());
        assert_eq!(v.value(), None);
    }

    #[test]
    fn failure_has_no_value() {
        let v: FailableValue<u8> = FailableValue::failed();
        assert!(v.did_fail());
        assert_eq!(v.into_value(), None);
    }

    #[test]
    fn success_carries_value() {
        let v = FailableValue::succeeded(Some(3));
        assert!(!v.did_fail());
        assert_eq!(v.value(), Some(&3));
        assert_eq!(FailableValue::from(Some(3)), v);
    }
}
