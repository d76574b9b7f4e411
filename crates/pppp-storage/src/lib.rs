//! Replicated object storage for PPPP.
//!
//! This crate provides typed, hash-indexed in-memory stores whose loud
//! mutations are handed to a [`ReplicationSink`], the identity hash that keys
//! every entry across nodes, and the type-tagged codecs that turn objects into
//! wire bytes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod erased;
mod error;
mod handle;
mod hash;
mod persist;
mod store;

pub use codec::{AnyObject, Codec, CodecRegistry, PropertyCodec};
pub use erased::AnyStore;
pub use error::{Result, StorageError};
pub use handle::Persisted;
pub use hash::{generate_hash, IdentityHash};
pub use persist::{Getter, Persist, Property, Setter};
pub use store::{ReplicationSink, Store};
