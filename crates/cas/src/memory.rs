//! In-memory backends for tests and as a fallback when no cache directory
//! is configured.
//!
//! Same semantics as the on-disk engine within a single process: digest
//! deduplication, stable references, first-writer-wins action bindings.
//! Nothing persists and nothing is shared across processes.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, Result};

use crate::hash::CasDigest;
use crate::traits::{ActionCache, CacheKey, LoadedObject, ObjectRef, ObjectStore, StoreStats};

#[derive(Default)]
struct MemoryInner {
    objects: Vec<(CasDigest, Vec<ObjectRef>, Vec<u8>)>,
    by_digest: HashMap<CasDigest, u64>,
}

/// Heap-backed [`ObjectStore`].
#[derive(Default)]
pub struct InMemoryObjectStore {
    inner: Mutex<MemoryInner>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn store(&self, refs: &[ObjectRef], data: &[u8]) -> Result<ObjectRef> {
        let mut inner = self.inner.lock().unwrap();
        let mut ref_digests = Vec::with_capacity(refs.len());
        for r in refs {
            let Some((digest, _, _)) = inner.objects.get(r.opaque_data() as usize) else {
                bail!("unknown object reference {}", r.opaque_data());
            };
            ref_digests.push(*digest);
        }
        let digest = CasDigest::of_object(ref_digests.iter(), data);
        if let Some(&index) = inner.by_digest.get(&digest) {
            return Ok(ObjectRef::from_opaque_data(index));
        }
        let index = inner.objects.len() as u64;
        inner.objects.push((digest, refs.to_vec(), data.to_vec()));
        inner.by_digest.insert(digest, index);
        Ok(ObjectRef::from_opaque_data(index))
    }

    fn get_id(&self, reference: ObjectRef) -> Result<CasDigest> {
        let inner = self.inner.lock().unwrap();
        match inner.objects.get(reference.opaque_data() as usize) {
            Some((digest, _, _)) => Ok(*digest),
            None => bail!("unknown object reference {}", reference.opaque_data()),
        }
    }

    fn get_reference(&self, digest: &CasDigest) -> Result<Option<ObjectRef>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .by_digest
            .get(digest)
            .map(|&index| ObjectRef::from_opaque_data(index)))
    }

    fn is_materialized(&self, reference: ObjectRef) -> Result<bool> {
        // Every in-memory object is created by store(), data included.
        self.get_id(reference).map(|_| true)
    }

    fn load_if_exists(&self, reference: ObjectRef) -> Result<Option<LoadedObject>> {
        let inner = self.inner.lock().unwrap();
        match inner.objects.get(reference.opaque_data() as usize) {
            Some((_, refs, data)) => Ok(Some(LoadedObject {
                data: data.clone(),
                refs: refs.clone(),
            })),
            None => bail!("unknown object reference {}", reference.opaque_data()),
        }
    }

    fn stats(&self) -> Result<StoreStats> {
        let inner = self.inner.lock().unwrap();
        let size_bytes = inner
            .objects
            .iter()
            .map(|(_, refs, data)| (refs.len() * 8 + data.len()) as u64)
            .sum();
        Ok(StoreStats {
            objects: inner.objects.len() as u64,
            size_bytes,
        })
    }
}

/// Heap-backed [`ActionCache`].
#[derive(Default)]
pub struct InMemoryActionCache {
    bindings: Mutex<HashMap<CacheKey, CasDigest>>,
}

impl InMemoryActionCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ActionCache for InMemoryActionCache {
    fn put(&self, key: &CacheKey, value: &CasDigest) -> Result<CasDigest> {
        let mut bindings = self.bindings.lock().unwrap();
        Ok(*bindings.entry(*key).or_insert(*value))
    }

    fn get(&self, key: &CacheKey) -> Result<Option<CasDigest>> {
        Ok(self.bindings.lock().unwrap().get(key).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_load() -> Result<()> {
        let store = InMemoryObjectStore::new();
        let child = store.store(&[], b"child")?;
        let root = store.store(&[child], b"root")?;

        let loaded = store.load_if_exists(root)?.expect("stored");
        assert_eq!(loaded.data, b"root");
        assert_eq!(loaded.refs, vec![child]);
        Ok(())
    }

    #[test]
    fn test_store_deduplicates() -> Result<()> {
        let store = InMemoryObjectStore::new();
        let a = store.store(&[], b"same")?;
        let b = store.store(&[], b"same")?;
        assert_eq!(a, b);
        assert_eq!(store.stats()?.objects, 1);
        Ok(())
    }

    #[test]
    fn test_digest_lookup() -> Result<()> {
        let store = InMemoryObjectStore::new();
        let r = store.store(&[], b"findable")?;
        let digest = store.get_id(r)?;
        assert_eq!(digest, CasDigest::of_data(b"findable"));
        assert_eq!(store.get_reference(&digest)?, Some(r));
        assert_eq!(store.get_reference(&CasDigest::of_data(b"absent"))?, None);
        Ok(())
    }

    #[test]
    fn test_unknown_reference_is_an_error() {
        let store = InMemoryObjectStore::new();
        assert!(store.get_id(ObjectRef::from_opaque_data(9)).is_err());
        assert!(store.store(&[ObjectRef::from_opaque_data(9)], b"x").is_err());
    }

    #[test]
    fn test_for_each_ref_default_impl() -> Result<()> {
        let store = InMemoryObjectStore::new();
        let a = store.store(&[], b"a")?;
        let b = store.store(&[], b"b")?;
        let root = store.store(&[a, b], b"root")?;

        let mut visited = vec![];
        store.for_each_ref(root, &mut |r| {
            visited.push(r);
            Ok(())
        })?;
        assert_eq!(visited, vec![a, b]);
        Ok(())
    }

    #[test]
    fn test_action_cache_first_writer_wins() -> Result<()> {
        let cache = InMemoryActionCache::new();
        let key = CacheKey::from_data(b"cc main.c");
        let first = CasDigest::of_data(b"output 1");
        let second = CasDigest::of_data(b"output 2");

        assert_eq!(cache.put(&key, &first)?, first);
        assert_eq!(cache.put(&key, &second)?, first);
        assert_eq!(cache.get(&key)?, Some(first));
        Ok(())
    }

    #[test]
    fn test_action_cache_miss() -> Result<()> {
        let cache = InMemoryActionCache::new();
        assert_eq!(cache.get(&CacheKey::from_data(b"nothing"))?, None);
        Ok(())
    }
}
