//! The content-addressed object store.
//!
//! Maps fixed-size content digests to immutable objects: a byte payload
//! plus an ordered list of references to other objects. Objects live in two
//! mapped files per database directory:
//!
//! ```text
//! {dir}/
//! ├── index.dat   # digest table: [digest][atomic u64 record offset], one
//! │               # fixed-stride entry per ObjectId, ordinal == id
//! ├── data.dat    # append-only records: [u32 nrefs][u32 reserved]
//! │               # [u64 data_len][u64 ref ids...][payload]
//! └── dblock      # write serialization across processes
//! ```
//!
//! An index entry can exist before its record does: `get_reference` hands
//! out ids for digests whose data has not been stored yet, which is what
//! makes forward references inside a DAG under construction work. The
//! record offset is published with a release store only after the record is
//! fully written, so lock-free readers never observe a torn object.
//!
//! Reads take no locks at all. Writes serialize on an exclusive `flock` of
//! `dblock`, with a bounded try-lock so contention surfaces as a typed
//! error instead of a hang.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::lockfile::{LockFile, LockKind};
use crate::mapped_file::{align8, max_mapping_size, MappedFile, HEADER_SIZE};

const INDEX_MAGIC: u64 = u64::from_le_bytes(*b"casgidx\0");
const DATA_MAGIC: u64 = u64::from_le_bytes(*b"casgdat\0");
const FORMAT_VERSION: u32 = 1;

/// Fixed space reserved for the hash scheme name in the index header.
const HASH_NAME_LEN: usize = 32;

/// Index user header: version + hash size + padded hash name.
const INDEX_HEADER_LEN: usize = 8 + HASH_NAME_LEN;
/// Data user header: version + reserved word.
const DATA_HEADER_LEN: usize = 8;

/// How long writers poll for the store's write lock before giving up.
const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Byte offset of the object-record header fields.
const RECORD_HEADER_LEN: u64 = 16;

/// Dense per-store handle for an object; ordinal into the digest table.
///
/// Stable for the lifetime of the store directory, but only meaningful
/// within it: translating an id between stores goes through digest lookup,
/// never through the raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    /// The raw table ordinal, for opaque transport through facade types.
    pub fn opaque_data(self) -> u64 {
        self.0
    }

    /// Rebuild from [`ObjectId::opaque_data`]. Pure bit-reinterpretation.
    pub fn from_opaque_data(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) fn index(self) -> u64 {
        self.0
    }
}

/// Handle to a loaded (materialized) object; the record offset in `data.dat`.
///
/// Valid for as long as the store that produced it stays open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHandle(u64);

impl ObjectHandle {
    /// The raw record offset, for opaque transport through facade types.
    pub fn opaque_data(self) -> u64 {
        self.0
    }

    /// Rebuild from [`ObjectHandle::opaque_data`]. Pure bit-reinterpretation.
    pub fn from_opaque_data(raw: u64) -> Self {
        Self(raw)
    }
}

/// How much of an object graph a read-through copies from upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultInPolicy {
    /// Copy the whole reachable DAG eagerly.
    #[default]
    FullTree,
    /// Copy only the requested node; children fault in on their own loads.
    SingleNode,
}

impl std::fmt::Display for FaultInPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultInPolicy::FullTree => write!(f, "full-tree"),
            FaultInPolicy::SingleNode => write!(f, "single-node"),
        }
    }
}

#[derive(Default)]
struct SeenDigests {
    by_digest: HashMap<Box<[u8]>, u64>,
    scanned: u64,
}

/// Durable, process-shared, content-addressed object storage.
pub struct GraphStore {
    dir: PathBuf,
    hash_name: String,
    hash_size: usize,
    index: MappedFile,
    data: MappedFile,
    write_lock: LockFile,
    seen: Mutex<SeenDigests>,
    upstream: Option<Arc<GraphStore>>,
    policy: FaultInPolicy,
}

impl GraphStore {
    /// Open or create an object store in `dir`.
    ///
    /// Fails with a typed error if the directory was created with a
    /// different hash name or digest size; schemes are never migrated.
    pub fn open(dir: &Path, hash_name: &str, hash_size: usize) -> Result<Self> {
        if hash_name.len() > HASH_NAME_LEN {
            return Err(StoreError::corrupt(
                dir,
                format!("hash name {hash_name:?} longer than {HASH_NAME_LEN} bytes"),
            ));
        }
        std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        let capacity = max_mapping_size()?;

        let mut index_header = [0u8; INDEX_HEADER_LEN];
        index_header[..4].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        index_header[4..8].copy_from_slice(&(hash_size as u32).to_le_bytes());
        index_header[8..8 + hash_name.len()].copy_from_slice(hash_name.as_bytes());

        let mut data_header = [0u8; DATA_HEADER_LEN];
        data_header[..4].copy_from_slice(&FORMAT_VERSION.to_le_bytes());

        let index = MappedFile::open(&dir.join("index.dat"), INDEX_MAGIC, capacity, &index_header)?;
        let data = MappedFile::open(&dir.join("data.dat"), DATA_MAGIC, capacity, &data_header)?;
        let write_lock = LockFile::open(&dir.join("dblock"))?;

        let store = Self {
            dir: dir.to_path_buf(),
            hash_name: hash_name.to_string(),
            hash_size,
            index,
            data,
            write_lock,
            seen: Mutex::new(SeenDigests::default()),
            upstream: None,
            policy: FaultInPolicy::default(),
        };
        store.validate_headers(hash_name, hash_size)?;
        Ok(store)
    }

    fn validate_headers(&self, hash_name: &str, hash_size: usize) -> Result<()> {
        let header = self.index.user_header(INDEX_HEADER_LEN)?;
        let version = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if version != FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                path: self.index.path().to_path_buf(),
                expected: FORMAT_VERSION,
                found: version,
            });
        }
        let found_size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let name_bytes = &header[8..];
        let end = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name_bytes.len());
        let found_name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();
        if found_size != hash_size || found_name != hash_name {
            return Err(StoreError::HashSchemaMismatch {
                path: self.dir.clone(),
                expected: format!("{hash_name}/{hash_size}"),
                found: format!("{found_name}/{found_size}"),
            });
        }

        let data_header = self.data.user_header(DATA_HEADER_LEN)?;
        let data_version = u32::from_le_bytes([
            data_header[0],
            data_header[1],
            data_header[2],
            data_header[3],
        ]);
        if data_version != FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                path: self.data.path().to_path_buf(),
                expected: FORMAT_VERSION,
                found: data_version,
            });
        }
        Ok(())
    }

    /// Wire a read-through upstream store: local misses consult it by
    /// digest and copy objects in according to `policy`.
    pub fn set_upstream(&mut self, upstream: Arc<GraphStore>, policy: FaultInPolicy) {
        self.upstream = Some(upstream);
        self.policy = policy;
    }

    /// The directory this store lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The hash scheme name recorded at creation.
    pub fn hash_name(&self) -> &str {
        &self.hash_name
    }

    /// Digest size in bytes for this store.
    pub fn hash_size(&self) -> usize {
        self.hash_size
    }

    fn digest_slot(&self) -> u64 {
        align8(self.hash_size as u64)
    }

    fn entry_stride(&self) -> u64 {
        self.digest_slot() + 8
    }

    fn entries_start(&self) -> u64 {
        HEADER_SIZE + align8(INDEX_HEADER_LEN as u64)
    }

    fn entry_offset(&self, index: u64) -> u64 {
        self.entries_start() + index * self.entry_stride()
    }

    /// Objects known to this store, materialized or not.
    pub fn num_objects(&self) -> u64 {
        (self.index.committed() - self.entries_start()) / self.entry_stride()
    }

    /// Committed on-disk bytes across both store files.
    pub fn size(&self) -> u64 {
        self.index.committed() + self.data.committed()
    }

    fn check_digest(&self, digest: &[u8]) -> Result<()> {
        if digest.len() != self.hash_size {
            return Err(StoreError::InvalidDigestSize {
                expected: self.hash_size,
                got: digest.len(),
            });
        }
        Ok(())
    }

    fn entry_state(&self, id: ObjectId) -> Result<&std::sync::atomic::AtomicU64> {
        if id.index() >= self.num_objects() {
            return Err(StoreError::UnknownObjectId(id.index()));
        }
        self.index
            .atomic_u64(self.entry_offset(id.index()) + self.digest_slot())
    }

    /// Scan index entries appended since the last scan, possibly by other
    /// processes, into the in-memory digest map.
    fn refresh(&self, seen: &mut SeenDigests) -> Result<()> {
        let total = self.num_objects();
        while seen.scanned < total {
            let i = seen.scanned;
            let digest = self
                .index
                .slice(self.entry_offset(i), self.hash_size as u64)?;
            seen.by_digest.entry(digest.into()).or_insert(i);
            seen.scanned += 1;
        }
        Ok(())
    }

    fn lookup(&self, digest: &[u8]) -> Result<Option<u64>> {
        let mut seen = self.seen.lock().unwrap();
        if let Some(&id) = seen.by_digest.get(digest) {
            return Ok(Some(id));
        }
        self.refresh(&mut seen)?;
        Ok(seen.by_digest.get(digest).copied())
    }

    /// The id for `digest`, allocating a fresh (unmaterialized) entry when
    /// the digest is new to this store. Deterministic per store session.
    pub fn get_reference(&self, digest: &[u8]) -> Result<ObjectId> {
        self.check_digest(digest)?;
        if let Some(id) = self.lookup(digest)? {
            return Ok(ObjectId(id));
        }

        let _guard = self
            .write_lock
            .try_lock(LockKind::Exclusive, WRITE_LOCK_TIMEOUT)?;
        // Another writer may have appended this digest while we waited.
        if let Some(id) = self.lookup(digest)? {
            return Ok(ObjectId(id));
        }

        let mut entry = vec![0u8; self.entry_stride() as usize];
        entry[..self.hash_size].copy_from_slice(digest);
        let offset = self.index.append(&entry)?;
        let id = (offset - self.entries_start()) / self.entry_stride();

        let mut seen = self.seen.lock().unwrap();
        seen.by_digest.insert(digest.into(), id);
        Ok(ObjectId(id))
    }

    /// Pure lookup: the id for `digest` if one was ever allocated here.
    pub fn get_existing_reference(&self, digest: &[u8]) -> Result<Option<ObjectId>> {
        self.check_digest(digest)?;
        Ok(self.lookup(digest)?.map(ObjectId))
    }

    /// The digest recorded for `id`. Zero-copy; borrows the index mapping.
    pub fn get_digest(&self, id: ObjectId) -> Result<&[u8]> {
        if id.index() >= self.num_objects() {
            return Err(StoreError::UnknownObjectId(id.index()));
        }
        self.index
            .slice(self.entry_offset(id.index()), self.hash_size as u64)
    }

    /// Whether `id` has materialized data in this store.
    pub fn contains_object(&self, id: ObjectId) -> Result<bool> {
        Ok(self.entry_state(id)?.load(std::sync::atomic::Ordering::Acquire) != 0)
    }

    /// Associate `data` and `refs` with `id`'s digest.
    ///
    /// Idempotent: storing an already-materialized digest is a no-op. The
    /// digest is trusted to fully determine the content; the store does not
    /// re-validate a second store against the first.
    pub fn store(&self, id: ObjectId, refs: &[ObjectId], data: &[u8]) -> Result<()> {
        use std::sync::atomic::Ordering;

        let state = self.entry_state(id)?;
        if state.load(Ordering::Acquire) != 0 {
            return Ok(());
        }

        let total = self.num_objects();
        let mut record =
            Vec::with_capacity(RECORD_HEADER_LEN as usize + 8 * refs.len() + data.len());
        record.extend_from_slice(&(refs.len() as u32).to_le_bytes());
        record.extend_from_slice(&0u32.to_le_bytes());
        record.extend_from_slice(&(data.len() as u64).to_le_bytes());
        for r in refs {
            if r.index() >= total {
                return Err(StoreError::UnknownObjectId(r.index()));
            }
            record.extend_from_slice(&r.index().to_le_bytes());
        }
        record.extend_from_slice(data);

        let _guard = self
            .write_lock
            .try_lock(LockKind::Exclusive, WRITE_LOCK_TIMEOUT)?;
        if state.load(Ordering::Acquire) != 0 {
            // Another writer materialized the same digest first.
            return Ok(());
        }
        let offset = self.data.append(&record)?;
        state.store(offset, Ordering::Release);
        Ok(())
    }

    /// A handle for reading `id`, or `None` if the digest is known but its
    /// data has not been stored (here or in any configured upstream).
    ///
    /// Ids only arise from this store's own allocation, so an out-of-range
    /// id is caller error and is reported as
    /// [`StoreError::UnknownObjectId`] rather than folded into `None`.
    pub fn load(&self, id: ObjectId) -> Result<Option<ObjectHandle>> {
        use std::sync::atomic::Ordering;

        let state = self.entry_state(id)?;
        let offset = state.load(Ordering::Acquire);
        if offset != 0 {
            return Ok(Some(ObjectHandle(offset)));
        }
        if self.upstream.is_some() {
            return self.fault_in(id);
        }
        Ok(None)
    }

    fn fault_in(&self, id: ObjectId) -> Result<Option<ObjectHandle>> {
        use std::sync::atomic::Ordering;

        let Some(upstream) = self.upstream.as_ref() else {
            return Ok(None);
        };
        let digest = self.get_digest(id)?.to_vec();
        let Some(up_id) = upstream.get_existing_reference(&digest)? else {
            return Ok(None);
        };
        if upstream.load(up_id)?.is_none() {
            return Ok(None);
        }
        debug!(
            digest = %hex::encode(&digest),
            policy = %self.policy,
            "faulting object in from upstream store"
        );
        match self.policy {
            FaultInPolicy::SingleNode => self.import_single(upstream, up_id, id)?,
            FaultInPolicy::FullTree => self.import_full_tree(upstream, up_id, id)?,
        }
        let offset = self.entry_state(id)?.load(Ordering::Acquire);
        Ok(if offset == 0 {
            None
        } else {
            Some(ObjectHandle(offset))
        })
    }

    fn import_single(&self, upstream: &GraphStore, up_id: ObjectId, local_id: ObjectId) -> Result<()> {
        let Some(handle) = upstream.load(up_id)? else {
            return Ok(());
        };
        let up_refs = upstream.object_refs(handle)?;
        let mut local_refs = Vec::with_capacity(up_refs.len());
        for up_ref in up_refs.iter() {
            // Allocate local ids for children without copying their data;
            // they fault in individually if and when they are loaded.
            local_refs.push(self.get_reference(upstream.get_digest(up_ref)?)?);
        }
        self.store(local_id, &local_refs, upstream.object_data(handle)?)
    }

    fn import_full_tree(
        &self,
        upstream: &GraphStore,
        up_root: ObjectId,
        local_root: ObjectId,
    ) -> Result<()> {
        #[derive(Clone, Copy)]
        struct Frame {
            up_id: ObjectId,
            local_id: ObjectId,
            expanded: bool,
        }

        // Iterative post-order copy; object graphs can be deep.
        let mut stack = vec![Frame {
            up_id: up_root,
            local_id: local_root,
            expanded: false,
        }];
        while let Some(frame) = stack.pop() {
            if self.contains_object(frame.local_id)? {
                continue;
            }
            let Some(handle) = upstream.load(frame.up_id)? else {
                return Err(StoreError::corrupt(
                    upstream.dir(),
                    "object graph references a node with no upstream data",
                ));
            };
            if !frame.expanded {
                stack.push(Frame {
                    expanded: true,
                    ..frame
                });
                for up_ref in upstream.object_refs(handle)?.iter() {
                    let local_ref = self.get_reference(upstream.get_digest(up_ref)?)?;
                    if !self.contains_object(local_ref)? {
                        stack.push(Frame {
                            up_id: up_ref,
                            local_id: local_ref,
                            expanded: false,
                        });
                    }
                }
            } else {
                let up_refs = upstream.object_refs(handle)?;
                let mut local_refs = Vec::with_capacity(up_refs.len());
                for up_ref in up_refs.iter() {
                    local_refs.push(self.get_reference(upstream.get_digest(up_ref)?)?);
                }
                self.store(frame.local_id, &local_refs, upstream.object_data(handle)?)?;
            }
        }
        Ok(())
    }

    fn record_nrefs(&self, handle: ObjectHandle) -> Result<u64> {
        let b = self.data.slice(handle.0, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as u64)
    }

    fn record_data_len(&self, handle: ObjectHandle) -> Result<u64> {
        let b = self.data.slice(handle.0 + 8, 8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Zero-copy view of the object payload; borrows the data mapping.
    pub fn object_data(&self, handle: ObjectHandle) -> Result<&[u8]> {
        let nrefs = self.record_nrefs(handle)?;
        let len = self.record_data_len(handle)?;
        self.data
            .slice(handle.0 + RECORD_HEADER_LEN + 8 * nrefs, len)
    }

    /// Zero-copy view of the object's references, in stored order.
    pub fn object_refs(&self, handle: ObjectHandle) -> Result<ObjectRefs<'_>> {
        let nrefs = self.record_nrefs(handle)?;
        let bytes = self.data.slice(handle.0 + RECORD_HEADER_LEN, 8 * nrefs)?;
        Ok(ObjectRefs { bytes })
    }

    /// Flush both mappings back to disk.
    pub fn flush(&self) -> Result<()> {
        self.index.flush()?;
        self.data.flush()
    }
}

/// Borrowed view of an object's reference list.
#[derive(Debug, Clone, Copy)]
pub struct ObjectRefs<'a> {
    bytes: &'a [u8],
}

impl<'a> ObjectRefs<'a> {
    pub fn len(&self) -> usize {
        self.bytes.len() / 8
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<ObjectId> {
        let chunk = self.bytes.get(i * 8..i * 8 + 8)?;
        Some(ObjectId(u64::from_le_bytes([
            chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
        ])))
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjectId> + 'a {
        self.bytes.chunks_exact(8).map(|chunk| {
            ObjectId(u64::from_le_bytes([
                chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
            ]))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(data: &[u8]) -> Vec<u8> {
        blake3::hash(data).as_bytes().to_vec()
    }

    fn open_store(dir: &Path) -> GraphStore {
        GraphStore::open(dir, "blake3", 32).unwrap()
    }

    #[test]
    fn test_get_reference_is_deterministic() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let d = digest_of(b"hello");
        let a = store.get_reference(&d)?;
        let b = store.get_reference(&d)?;
        assert_eq!(a, b);

        let other = store.get_reference(&digest_of(b"world"))?;
        assert_ne!(a, other);
        Ok(())
    }

    #[test]
    fn test_forward_reference_loads_none() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let id = store.get_reference(&digest_of(b"future"))?;
        assert!(!store.contains_object(id)?);
        assert!(store.load(id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_store_and_load_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let c1 = store.get_reference(&digest_of(b"child one"))?;
        let c2 = store.get_reference(&digest_of(b"child two"))?;
        store.store(c1, &[], b"child one")?;
        store.store(c2, &[], b"child two")?;

        let root = store.get_reference(&digest_of(b"root"))?;
        store.store(root, &[c1, c2], b"root payload")?;

        let handle = store.load(root)?.expect("materialized");
        assert_eq!(store.object_data(handle)?, b"root payload");

        let refs = store.object_refs(handle)?;
        assert_eq!(refs.len(), 2);
        // Order-preserving.
        assert_eq!(refs.get(0), Some(c1));
        assert_eq!(refs.get(1), Some(c2));
        let collected: Vec<_> = refs.iter().collect();
        assert_eq!(collected, vec![c1, c2]);
        Ok(())
    }

    #[test]
    fn test_store_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let id = store.get_reference(&digest_of(b"once"))?;
        store.store(id, &[], b"once")?;
        let size_after_first = store.size();

        store.store(id, &[], b"once")?;
        assert_eq!(store.size(), size_after_first);
        assert_eq!(store.num_objects(), 1);
        Ok(())
    }

    #[test]
    fn test_get_existing_reference_does_not_allocate() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        assert!(store.get_existing_reference(&digest_of(b"ghost"))?.is_none());
        assert_eq!(store.num_objects(), 0);

        let id = store.get_reference(&digest_of(b"ghost"))?;
        assert_eq!(store.get_existing_reference(&digest_of(b"ghost"))?, Some(id));
        Ok(())
    }

    #[test]
    fn test_digest_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let d = digest_of(b"lookup me");
        let id = store.get_reference(&d)?;
        assert_eq!(store.get_digest(id)?, &d[..]);
        Ok(())
    }

    #[test]
    fn test_wrong_digest_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let err = store.get_reference(&[0u8; 16]);
        assert!(matches!(
            err,
            Err(StoreError::InvalidDigestSize {
                expected: 32,
                got: 16
            })
        ));
    }

    #[test]
    fn test_unknown_object_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let bogus = ObjectId::from_opaque_data(42);
        assert!(matches!(
            store.load(bogus),
            Err(StoreError::UnknownObjectId(42))
        ));
    }

    #[test]
    fn test_hash_scheme_mismatch_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            open_store(dir.path());
        }
        let err = GraphStore::open(dir.path(), "sha256", 32);
        assert!(matches!(err, Err(StoreError::HashSchemaMismatch { .. })));

        let err = GraphStore::open(dir.path(), "blake3", 20);
        assert!(matches!(err, Err(StoreError::HashSchemaMismatch { .. })));
    }

    #[test]
    fn test_persistence_across_reopen() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let d = digest_of(b"durable");
        let id;
        {
            let store = open_store(dir.path());
            id = store.get_reference(&d)?;
            store.store(id, &[], b"durable")?;
        }
        let store = open_store(dir.path());
        let found = store.get_existing_reference(&d)?.expect("still known");
        assert_eq!(found, id);
        let handle = store.load(found)?.expect("still materialized");
        assert_eq!(store.object_data(handle)?, b"durable");
        Ok(())
    }

    #[test]
    fn test_two_instances_see_each_other() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let a = open_store(dir.path());
        let b = open_store(dir.path());

        let d = digest_of(b"cross instance");
        let id_a = a.get_reference(&d)?;
        a.store(id_a, &[], b"cross instance")?;

        // b opened before the write; its lazy rescan must find it.
        let id_b = b.get_existing_reference(&d)?.expect("visible to b");
        assert_eq!(id_b.opaque_data(), id_a.opaque_data());
        let handle = b.load(id_b)?.expect("materialized in b's view");
        assert_eq!(b.object_data(handle)?, b"cross instance");
        Ok(())
    }

    /// Child half of `test_cross_process_visibility`; only does anything
    /// when re-executed by the parent with the directory in the
    /// environment.
    #[test]
    #[ignore]
    fn cross_process_writer() {
        let Ok(dir) = std::env::var("CAS_ONDISK_WRITER_DIR") else {
            return;
        };
        let store = open_store(Path::new(&dir));
        let id = store.get_reference(&digest_of(b"from the child")).unwrap();
        store.store(id, &[], b"from the child").unwrap();
    }

    #[test]
    fn test_cross_process_visibility() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let before = store.get_reference(&digest_of(b"from the parent"))?;
        store.store(before, &[], b"from the parent")?;

        // Re-run this test binary as a real second process that appends an
        // object to the same directory.
        let exe = std::env::current_exe().unwrap();
        let status = std::process::Command::new(exe)
            .args(["graph::tests::cross_process_writer", "--exact", "--ignored"])
            .env("CAS_ONDISK_WRITER_DIR", dir.path())
            .status()
            .unwrap();
        assert!(status.success());

        // The already-open parent instance picks the write up through its
        // lazy tail rescan.
        let id = store
            .get_existing_reference(&digest_of(b"from the child"))?
            .expect("child's write visible");
        let handle = store.load(id)?.expect("materialized by the child");
        assert_eq!(store.object_data(handle)?, b"from the child");
        Ok(())
    }

    #[test]
    fn test_concurrent_stores_of_same_object() -> Result<()> {
        use std::sync::Arc;
        use std::thread;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(dir.path()));
        let d = digest_of(b"contended");

        let mut handles = vec![];
        for _ in 0..8 {
            let store = store.clone();
            let d = d.clone();
            handles.push(thread::spawn(move || {
                let id = store.get_reference(&d).expect("get_reference");
                store.store(id, &[], b"contended").expect("store");
                id
            }));
        }
        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));

        // Deduplicated: one entry, one record.
        assert_eq!(store.num_objects(), 1);
        let handle = store.load(ids[0])?.expect("materialized");
        assert_eq!(store.object_data(handle)?, b"contended");
        Ok(())
    }

    #[test]
    fn test_fault_in_single_node() -> Result<()> {
        let upstream_dir = tempfile::tempdir().unwrap();
        let primary_dir = tempfile::tempdir().unwrap();

        let upstream = Arc::new(open_store(upstream_dir.path()));
        let child = upstream.get_reference(&digest_of(b"leaf"))?;
        upstream.store(child, &[], b"leaf")?;
        let root = upstream.get_reference(&digest_of(b"branch"))?;
        upstream.store(root, &[child], b"branch")?;

        let mut primary = open_store(primary_dir.path());
        primary.set_upstream(upstream, FaultInPolicy::SingleNode);

        let local_root = primary.get_reference(&digest_of(b"branch"))?;
        let handle = primary.load(local_root)?.expect("faulted in");
        assert_eq!(primary.object_data(handle)?, b"branch");

        // Child was allocated but not copied; it faults in on its own load.
        let refs = primary.object_refs(handle)?;
        let local_child = refs.get(0).unwrap();
        assert!(!primary.contains_object(local_child)?);
        let child_handle = primary.load(local_child)?.expect("child faulted in");
        assert_eq!(primary.object_data(child_handle)?, b"leaf");
        Ok(())
    }

    #[test]
    fn test_fault_in_full_tree() -> Result<()> {
        let upstream_dir = tempfile::tempdir().unwrap();
        let primary_dir = tempfile::tempdir().unwrap();

        let upstream = Arc::new(open_store(upstream_dir.path()));
        let c1 = upstream.get_reference(&digest_of(b"c1"))?;
        upstream.store(c1, &[], b"c1")?;
        let c2 = upstream.get_reference(&digest_of(b"c2"))?;
        upstream.store(c2, &[c1], b"c2")?;
        let root = upstream.get_reference(&digest_of(b"r"))?;
        upstream.store(root, &[c1, c2], b"r")?;

        let mut primary = open_store(primary_dir.path());
        primary.set_upstream(upstream, FaultInPolicy::FullTree);

        let local_root = primary.get_reference(&digest_of(b"r"))?;
        let handle = primary.load(local_root)?.expect("faulted in");
        assert_eq!(primary.object_data(handle)?, b"r");

        // The whole DAG is local now.
        for r in primary.object_refs(handle)?.iter() {
            assert!(primary.contains_object(r)?);
        }
        Ok(())
    }

    #[test]
    fn test_fault_in_miss_stays_none() -> Result<()> {
        let upstream_dir = tempfile::tempdir().unwrap();
        let primary_dir = tempfile::tempdir().unwrap();

        let upstream = Arc::new(open_store(upstream_dir.path()));
        let mut primary = open_store(primary_dir.path());
        primary.set_upstream(upstream, FaultInPolicy::FullTree);

        let id = primary.get_reference(&digest_of(b"nowhere"))?;
        assert!(primary.load(id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_empty_object() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let id = store.get_reference(&digest_of(b""))?;
        store.store(id, &[], b"")?;
        let handle = store.load(id)?.expect("materialized");
        assert_eq!(store.object_data(handle)?, b"");
        assert!(store.object_refs(handle)?.is_empty());
        Ok(())
    }
}
