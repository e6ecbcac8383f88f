//! The on-disk backend: [`ObjectStore`]/[`ActionCache`] over a
//! [`cas_ondisk::UnifiedCache`] directory.
//!
//! Reference translation between the trait's opaque `u64`s and the
//! engine's dense ids is bit-reinterpretation, so this adapter adds no
//! indirection to the object access path. Trait loads copy the payload
//! out; callers that want the zero-copy mapped views can reach the engine
//! through [`OnDiskStore::engine`].

use std::path::Path;

use anyhow::{Context, Result};
use cas_ondisk::{FaultInPolicy, ObjectId, UnifiedCache};

use crate::hash::{CasDigest, DIGEST_LEN};
use crate::traits::{ActionCache, CacheKey, LoadedObject, ObjectRef, ObjectStore, StoreStats};

/// Hash scheme name recorded in store directories.
pub const HASH_NAME: &str = "blake3";

fn to_id(reference: ObjectRef) -> ObjectId {
    ObjectId::from_opaque_data(reference.opaque_data())
}

fn to_ref(id: ObjectId) -> ObjectRef {
    ObjectRef::from_opaque_data(id.opaque_data())
}

/// A content-addressed store persisted in a shared cache directory.
pub struct OnDiskStore {
    cache: UnifiedCache,
}

impl OnDiskStore {
    /// Open or create the cache directory at `path`.
    pub fn open(path: &Path, size_limit: Option<u64>, policy: FaultInPolicy) -> Result<Self> {
        let cache = UnifiedCache::open(path, size_limit, HASH_NAME, DIGEST_LEN, policy)
            .with_context(|| format!("failed to open cache directory: {}", path.display()))?;
        Ok(Self { cache })
    }

    /// The underlying engine, for zero-copy reads and GC control.
    pub fn engine(&self) -> &UnifiedCache {
        &self.cache
    }

    /// Flush and release the directory; see [`UnifiedCache::close`].
    pub fn close(self, check_size_limit: bool) -> Result<()> {
        self.cache
            .close(check_size_limit)
            .context("failed to close cache directory")
    }

    fn digest_at(&self, id: ObjectId) -> Result<CasDigest> {
        let bytes = self.cache.graph().get_digest(id)?;
        Ok(CasDigest::try_from_slice(bytes)?)
    }
}

impl ObjectStore for OnDiskStore {
    fn store(&self, refs: &[ObjectRef], data: &[u8]) -> Result<ObjectRef> {
        let graph = self.cache.graph();
        let ids: Vec<ObjectId> = refs.iter().map(|&r| to_id(r)).collect();
        let mut ref_digests = Vec::with_capacity(ids.len());
        for &id in &ids {
            ref_digests.push(self.digest_at(id)?);
        }
        let digest = CasDigest::of_object(ref_digests.iter(), data);
        let id = graph.get_reference(digest.as_bytes())?;
        graph.store(id, &ids, data)?;
        Ok(to_ref(id))
    }

    fn get_id(&self, reference: ObjectRef) -> Result<CasDigest> {
        self.digest_at(to_id(reference))
    }

    fn get_reference(&self, digest: &CasDigest) -> Result<Option<ObjectRef>> {
        let found = self
            .cache
            .graph()
            .get_existing_reference(digest.as_bytes())?;
        Ok(found.map(to_ref))
    }

    fn is_materialized(&self, reference: ObjectRef) -> Result<bool> {
        Ok(self.cache.graph().contains_object(to_id(reference))?)
    }

    fn load_if_exists(&self, reference: ObjectRef) -> Result<Option<LoadedObject>> {
        let graph = self.cache.graph();
        let Some(handle) = graph.load(to_id(reference))? else {
            return Ok(None);
        };
        Ok(Some(LoadedObject {
            data: graph.object_data(handle)?.to_vec(),
            refs: graph.object_refs(handle)?.iter().map(to_ref).collect(),
        }))
    }

    fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            objects: self.cache.graph().num_objects(),
            size_bytes: self.cache.size(),
        })
    }
}

impl ActionCache for OnDiskStore {
    fn put(&self, key: &CacheKey, value: &CasDigest) -> Result<CasDigest> {
        let value_id = self.cache.graph().get_reference(value.as_bytes())?;
        let winner = self.cache.kv_put(key.digest().as_bytes(), value_id)?;
        self.digest_at(winner)
    }

    fn get(&self, key: &CacheKey) -> Result<Option<CasDigest>> {
        match self.cache.kv_get(key.digest().as_bytes())? {
            Some(id) => Ok(Some(self.digest_at(id)?)),
            None => Ok(None),
        }
    }
}
