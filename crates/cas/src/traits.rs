//! Store-agnostic interfaces for content-addressed storage.
//!
//! Upper layers (compiler result caching, artifact distribution) program
//! against [`ObjectStore`] and [`ActionCache`] so that the backing
//! implementation can be the on-disk engine, an in-memory store for tests,
//! or anything else. References are opaque `u64`s; backends that already
//! use dense integer handles convert by bit-reinterpretation, with no
//! allocation or indirection on the access path.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hash::CasDigest;

/// Opaque reference to an object within one open store.
///
/// Only meaningful to the store that produced it; moving an object between
/// stores goes through its [`CasDigest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef(u64);

impl ObjectRef {
    /// The raw representation. Backends reinterpret this directly.
    pub fn opaque_data(self) -> u64 {
        self.0
    }

    /// Rebuild from [`ObjectRef::opaque_data`].
    pub fn from_opaque_data(raw: u64) -> Self {
        Self(raw)
    }
}

/// Key for an action cache lookup, e.g. the hash of a compiler invocation
/// plus all of its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(pub CasDigest);

impl CacheKey {
    /// Key a raw byte description of the action.
    pub fn from_data(data: &[u8]) -> Self {
        Self(CasDigest::of_data(data))
    }

    /// The underlying digest.
    pub fn digest(&self) -> &CasDigest {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An object loaded out of a store: owned payload plus ordered references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedObject {
    pub data: Vec<u8>,
    pub refs: Vec<ObjectRef>,
}

/// Aggregate store statistics, for diagnostics output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Objects known to the store, materialized or not.
    pub objects: u64,
    /// Committed storage in bytes.
    pub size_bytes: u64,
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} objects, {} bytes", self.objects, self.size_bytes)
    }
}

/// Content-addressed object storage.
///
/// Objects are immutable payload + reference tuples, deduplicated by
/// digest. Storing the same content twice returns the same reference.
pub trait ObjectStore: Send + Sync {
    /// Store an object built from already-stored references and a payload.
    fn store(&self, refs: &[ObjectRef], data: &[u8]) -> Result<ObjectRef>;

    /// The digest identifying `reference`'s object.
    fn get_id(&self, reference: ObjectRef) -> Result<CasDigest>;

    /// The reference for `digest`, if this store has ever seen it.
    fn get_reference(&self, digest: &CasDigest) -> Result<Option<ObjectRef>>;

    /// Whether the object's data is present in this store.
    fn is_materialized(&self, reference: ObjectRef) -> Result<bool>;

    /// Load the object if its data is available, `None` otherwise.
    fn load_if_exists(&self, reference: ObjectRef) -> Result<Option<LoadedObject>>;

    /// Visit each reference of a materialized object, in stored order.
    fn for_each_ref(
        &self,
        reference: ObjectRef,
        f: &mut dyn FnMut(ObjectRef) -> Result<()>,
    ) -> Result<()> {
        let Some(object) = self.load_if_exists(reference)? else {
            anyhow::bail!("object {} is not materialized", reference.opaque_data());
        };
        for r in object.refs {
            f(r)?;
        }
        Ok(())
    }

    /// Aggregate statistics for diagnostics.
    fn stats(&self) -> Result<StoreStats>;
}

/// Maps action keys to result digests, first writer wins.
pub trait ActionCache: Send + Sync {
    /// Bind `value` to `key` and return the winning binding, which is the
    /// existing one if another writer got there first.
    fn put(&self, key: &CacheKey, value: &CasDigest) -> Result<CasDigest>;

    /// Look up the binding for `key`.
    fn get(&self, key: &CacheKey) -> Result<Option<CasDigest>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_ref_opaque_roundtrip() {
        let r = ObjectRef::from_opaque_data(0xdead_beef);
        assert_eq!(r.opaque_data(), 0xdead_beef);
        assert_eq!(ObjectRef::from_opaque_data(r.opaque_data()), r);
    }

    #[test]
    fn test_cache_key_from_data_is_stable() {
        assert_eq!(CacheKey::from_data(b"cc -O2"), CacheKey::from_data(b"cc -O2"));
        assert_ne!(CacheKey::from_data(b"cc -O2"), CacheKey::from_data(b"cc -O3"));
    }

    #[test]
    fn test_stats_display() {
        let stats = StoreStats {
            objects: 3,
            size_bytes: 4096,
        };
        assert_eq!(stats.to_string(), "3 objects, 4096 bytes");
    }
}
