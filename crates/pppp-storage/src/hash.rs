//! Identity hashing using SHA-256.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::Persist;

/// The 64-bit identity of a stored object.
///
/// Derived only from the object's identity properties, so every node
/// computes the same value for structurally equal objects.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityHash(i64);

impl IdentityHash {
    /// Wraps a raw hash received from the wire.
    #[must_use]
    pub const fn from_i64(raw: i64) -> Self {
        Self(raw)
    }

    /// Returns the raw value carried on the wire.
    #[must_use]
    pub const fn as_i64(&self) -> i64 {
        self.0
    }

    /// Returns the hash as a hex string.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_be_bytes())
    }
}

impl From<i64> for IdentityHash {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

impl From<IdentityHash> for i64 {
    fn from(hash: IdentityHash) -> Self {
        hash.0
    }
}

impl fmt::Debug for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityHash({})", self.to_hex())
    }
}

impl fmt::Display for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Computes the identity hash of `obj`.
///
/// The digest covers the type name and then each identity property, sorted
/// by name, as its length-prefixed name followed by the encoded value. The
/// first eight bytes of the digest form the hash.
#[must_use]
pub fn generate_hash<T: Persist>(obj: &T) -> IdentityHash {
    let mut properties: Vec<_> = T::properties()
        .into_iter()
        .filter(|p| p.is_identity())
        .collect();
    properties.sort_by(|a, b| a.name().cmp(b.name()));

    let mut hasher = Sha256::new();
    hasher.update(T::TYPE_NAME.as_bytes());
    for property in properties {
        let name = property.name().as_bytes();
        hasher.update((name.len() as u16).to_be_bytes());
        hasher.update(name);
        hasher.update(property.get(obj).to_bytes());
    }
    let digest = hasher.finalize();

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    IdentityHash(i64::from_be_bytes(head))
}
