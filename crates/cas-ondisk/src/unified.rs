//! Unified cache directory: object store + key-value index + GC lifecycle.
//!
//! Composes one primary [`GraphStore`]/[`KeyValueStore`] pair with the
//! surviving older generations chained behind it as read-through
//! upstreams, under a single root directory:
//!
//! ```text
//! {root}/
//! ├── lock           # held shared by every open instance; exclusive for GC
//! ├── initlock       # serializes directory scaffolding between openers
//! ├── settings.json  # hash scheme + fault-in policy, validated on reopen
//! ├── needs-gc       # sticky marker naming the generation that outgrew us
//! ├── v1/ v2/ ...    # generation databases, newest is the primary
//! └── gc.tmp/        # in-progress compaction target, ignored if stale
//! ```
//!
//! Generations drive garbage collection. When the needs-gc marker names the
//! newest generation, the next open starts a fresh generation with every
//! older one chained behind it as upstream; live data migrates forward
//! through fault-in as it is accessed. The chain matters under
//! single-node fault-in, where a root can migrate while its children's
//! data stays several generations back. [`UnifiedCache::collect_garbage`] then compacts the newest
//! generation into a fresh directory and deletes everything older. The
//! whole-directory lock makes this safe to attempt at any time: while any
//! instance in any process holds the directory open, the collector cannot
//! take the exclusive lock and degrades to a no-op.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::graph::{FaultInPolicy, GraphStore, ObjectId};
use crate::keyvalue::KeyValueStore;
use crate::lockfile::{LockFile, LockKind};

const SETTINGS_FILE: &str = "settings.json";
const NEEDS_GC_FILE: &str = "needs-gc";
const GC_TMP_DIR: &str = "gc.tmp";
const GEN_PREFIX: &str = "v";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CacheSettings {
    hash_name: String,
    hash_size: usize,
    policy: FaultInPolicy,
}

/// A content-addressed cache directory shared between processes.
///
/// Holds the directory's shared lock for its whole lifetime; dropping the
/// cache releases it. The size limit is advisory: exceeding it never fails
/// a write, it only makes [`UnifiedCache::close`] set the sticky needs-gc
/// marker so a later [`UnifiedCache::collect_garbage`] can reclaim space.
pub struct UnifiedCache {
    root: PathBuf,
    lock: LockFile,
    size_limit: Option<u64>,
    generation: u64,
    primary: GraphStore,
    kv: KeyValueStore,
    /// Older generations in ascending order; the last is the primary's
    /// direct upstream, each is wired to the next-older one.
    upstream: Vec<Arc<GraphStore>>,
    upstream_kv: Option<KeyValueStore>,
    closed: bool,
}

impl UnifiedCache {
    /// Open or create a cache directory at `root`.
    ///
    /// Reopening with a different hash scheme or fault-in policy than the
    /// directory was created with is a typed fatal error.
    pub fn open(
        root: &Path,
        size_limit: Option<u64>,
        hash_name: &str,
        hash_size: usize,
        policy: FaultInPolicy,
    ) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| StoreError::io(root, e))?;

        // Lifetime shared lock first: once held, no collector can win the
        // exclusive lock, so the directory layout is stable underneath us.
        let lock = LockFile::open(&root.join("lock"))?;
        lock.lock_raw(LockKind::Shared)?;

        let generation = {
            let init = LockFile::open(&root.join("initlock"))?;
            let _guard = init.lock(LockKind::Exclusive)?;
            Self::init_settings(root, hash_name, hash_size, policy)?;
            Self::pick_generation(root)?
        };

        let gen_dir = generation_dir(root, generation);
        let mut primary = GraphStore::open(&gen_dir, hash_name, hash_size)?;
        let kv = KeyValueStore::open(&gen_dir, hash_size)?;

        // Chain every older generation, oldest first, so a lookup can reach
        // data that never migrated past an intermediate generation.
        let mut upstream: Vec<Arc<GraphStore>> = vec![];
        for older in list_generations(root)? {
            if older >= generation {
                continue;
            }
            let mut store = GraphStore::open(&generation_dir(root, older), hash_name, hash_size)?;
            if let Some(next_older) = upstream.last() {
                store.set_upstream(next_older.clone(), policy);
            }
            upstream.push(Arc::new(store));
        }
        let mut upstream_kv = None;
        if let Some(nearest) = upstream.last() {
            primary.set_upstream(nearest.clone(), policy);
            upstream_kv = Some(KeyValueStore::open(nearest.dir(), hash_size)?);
        }

        debug!(
            root = %root.display(),
            generation,
            upstream_generations = upstream.len(),
            "opened cache directory"
        );
        Ok(Self {
            root: root.to_path_buf(),
            lock,
            size_limit,
            generation,
            primary,
            kv,
            upstream,
            upstream_kv,
            closed: false,
        })
    }

    /// Create or validate `settings.json`. Caller holds the init lock.
    fn init_settings(
        root: &Path,
        hash_name: &str,
        hash_size: usize,
        policy: FaultInPolicy,
    ) -> Result<()> {
        let path = root.join(SETTINGS_FILE);
        match read_settings(root)? {
            Some(existing) => {
                if existing.hash_name != hash_name || existing.hash_size != hash_size {
                    return Err(StoreError::HashSchemaMismatch {
                        path,
                        expected: format!("{hash_name}/{hash_size}"),
                        found: format!("{}/{}", existing.hash_name, existing.hash_size),
                    });
                }
                if existing.policy != policy {
                    return Err(StoreError::PolicyMismatch {
                        path,
                        expected: policy.to_string(),
                        found: existing.policy.to_string(),
                    });
                }
            }
            None => {
                let settings = CacheSettings {
                    hash_name: hash_name.to_string(),
                    hash_size,
                    policy,
                };
                let body = serde_json::to_string_pretty(&settings)
                    .map_err(|e| StoreError::corrupt(&path, e.to_string()))?;
                std::fs::write(&path, body).map_err(|e| StoreError::io(&path, e))?;
            }
        }
        Ok(())
    }

    /// Choose the primary generation, starting a fresh one when the
    /// needs-gc marker names the current newest. Caller holds the init lock.
    fn pick_generation(root: &Path) -> Result<u64> {
        let newest = list_generations(root)?.last().copied().unwrap_or(0);
        if newest == 0 {
            return Ok(1);
        }
        match read_gc_marker(root)? {
            Some(flagged) if flagged >= newest => {
                info!(
                    flagged,
                    next = newest + 1,
                    "generation flagged for collection; starting a fresh one"
                );
                Ok(newest + 1)
            }
            _ => Ok(newest),
        }
    }

    /// The cache root directory.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// The generation number of the primary database.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The primary object store.
    pub fn graph(&self) -> &GraphStore {
        &self.primary
    }

    /// The advisory size limit, if one was set.
    pub fn size_limit(&self) -> Option<u64> {
        self.size_limit
    }

    /// Replace the advisory size limit.
    pub fn set_size_limit(&mut self, limit: Option<u64>) {
        self.size_limit = limit;
    }

    /// Committed bytes across every open generation.
    pub fn size(&self) -> u64 {
        let mut total = self.primary.size() + self.kv.size();
        for store in &self.upstream {
            total += store.size();
        }
        if let Some(upstream_kv) = &self.upstream_kv {
            total += upstream_kv.size();
        }
        total
    }

    /// Whether the directory has outgrown its advisory size limit.
    pub fn has_exceeded_size_limit(&self) -> bool {
        match self.size_limit {
            Some(limit) => self.size() > limit,
            None => false,
        }
    }

    /// Whether the sticky needs-gc marker is set for this directory.
    pub fn needs_garbage_collection(&self) -> bool {
        self.root.join(NEEDS_GC_FILE).exists()
    }

    /// Set the sticky needs-gc marker explicitly.
    pub fn request_garbage_collection(&self) -> Result<()> {
        self.mark_needs_gc()
    }

    fn mark_needs_gc(&self) -> Result<()> {
        let path = self.root.join(NEEDS_GC_FILE);
        std::fs::write(&path, format!("{}\n", self.generation))
            .map_err(|e| StoreError::io(&path, e))
    }

    /// Associate `value` with `key` and return the winning binding.
    ///
    /// First writer wins: if the key is already bound, the existing id is
    /// returned and `value` is discarded.
    pub fn kv_put(&self, key: &[u8], value: ObjectId) -> Result<ObjectId> {
        let winner = self.kv.put(key, value.opaque_data())?;
        Ok(ObjectId::from_opaque_data(winner))
    }

    /// [`UnifiedCache::kv_put`] with an object's digest as the key,
    /// unifying the key and object digest namespaces.
    pub fn kv_put_id(&self, key: ObjectId, value: ObjectId) -> Result<ObjectId> {
        let digest = self.primary.get_digest(key)?.to_vec();
        self.kv_put(&digest, value)
    }

    /// Look up `key`, faulting the binding in from the upstream generation
    /// on a miss.
    ///
    /// An upstream hit copies the referenced object graph into the primary
    /// store according to the directory's fault-in policy, then binds the
    /// translated id locally so later lookups stay local.
    pub fn kv_get(&self, key: &[u8]) -> Result<Option<ObjectId>> {
        if let Some(value) = self.kv.get(key)? {
            return Ok(Some(ObjectId::from_opaque_data(value)));
        }
        let (Some(upstream), Some(upstream_kv)) = (self.upstream.last(), &self.upstream_kv)
        else {
            return Ok(None);
        };
        let Some(up_value) = upstream_kv.get(key)? else {
            return Ok(None);
        };

        // Ids are per-store; translate through the digest, then let the
        // graph-level fault-in copy the object data across.
        let up_id = ObjectId::from_opaque_data(up_value);
        let digest = upstream.get_digest(up_id)?.to_vec();
        let local = self.primary.get_reference(&digest)?;
        let _ = self.primary.load(local)?;
        debug!(key = %hex::encode(key), "faulted key binding in from upstream generation");

        let winner = self.kv.put(key, local.opaque_data())?;
        Ok(Some(ObjectId::from_opaque_data(winner)))
    }

    fn close_impl(&mut self, check_size_limit: bool) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.primary.flush()?;
        self.kv.flush()?;
        if check_size_limit && self.has_exceeded_size_limit() {
            info!(
                root = %self.root.display(),
                size = self.size(),
                "size limit exceeded; marking directory for garbage collection"
            );
            self.mark_needs_gc()?;
        }
        Ok(())
    }

    /// Flush and release the directory.
    ///
    /// With `check_size_limit`, records the sticky needs-gc marker when the
    /// advisory limit is exceeded. Dropping an unclosed cache does the same
    /// with errors swallowed.
    pub fn close(mut self, check_size_limit: bool) -> Result<()> {
        self.close_impl(check_size_limit)
    }

    /// Compact the cache directory at `root`, reclaiming dead data.
    ///
    /// Safe to call at any time, from any process: if any instance holds
    /// the directory open the exclusive lock is unavailable and the call
    /// returns without touching anything. With exclusive access, every key
    /// binding in the newest generation is copied (with its full object
    /// DAG) into a fresh generation built under a temporary name, which is
    /// then atomically renamed in; all older generations and the needs-gc
    /// marker are removed. A temp directory left by a crashed collection is
    /// deleted and rebuilt.
    pub fn collect_garbage(root: &Path) -> Result<()> {
        let lock = LockFile::open(&root.join("lock"))?;
        let _guard = match lock.try_lock(LockKind::Exclusive, Duration::ZERO) {
            Ok(guard) => guard,
            Err(StoreError::NoLockAvailable { .. }) => {
                debug!(root = %root.display(), "directory is held open; skipping collection");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let Some(settings) = read_settings(root)? else {
            return Ok(());
        };
        let generations = list_generations(root)?;
        let Some(&newest) = generations.last() else {
            return Ok(());
        };

        let tmp = root.join(GC_TMP_DIR);
        remove_dir_if_present(&tmp)?;

        // Bindings may still point at data that never migrated forward,
        // possibly several generations back; chain everything so compaction
        // can reach through to it.
        let mut chain: Option<Arc<GraphStore>> = None;
        for &gen in &generations {
            let mut store =
                GraphStore::open(&generation_dir(root, gen), &settings.hash_name, settings.hash_size)?;
            if let Some(older) = chain.take() {
                store.set_upstream(older, FaultInPolicy::FullTree);
            }
            chain = Some(Arc::new(store));
        }
        let Some(old) = chain else {
            return Ok(());
        };
        let old_kv = KeyValueStore::open(&generation_dir(root, newest), settings.hash_size)?;

        let mut fresh = GraphStore::open(&tmp, &settings.hash_name, settings.hash_size)?;
        fresh.set_upstream(old.clone(), FaultInPolicy::FullTree);
        let fresh_kv = KeyValueStore::open(&tmp, settings.hash_size)?;

        let mut copied = 0u64;
        old_kv.for_each(|key, value| {
            let digest = old.get_digest(ObjectId::from_opaque_data(value))?.to_vec();
            let local = fresh.get_reference(&digest)?;
            let _ = fresh.load(local)?;
            fresh_kv.put(key, local.opaque_data())?;
            copied += 1;
            Ok(())
        })?;
        fresh.flush()?;
        fresh_kv.flush()?;

        // Close every mapping before renaming so the files shrink to their
        // committed sizes.
        drop(fresh);
        drop(fresh_kv);
        drop(old_kv);
        drop(old);

        let new_dir = generation_dir(root, newest + 1);
        std::fs::rename(&tmp, &new_dir).map_err(|e| StoreError::io(&tmp, e))?;
        for gen in generations {
            remove_dir_if_present(&generation_dir(root, gen))?;
        }
        let marker = root.join(NEEDS_GC_FILE);
        if let Err(e) = std::fs::remove_file(&marker) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(StoreError::io(&marker, e));
            }
        }
        info!(
            root = %root.display(),
            bindings = copied,
            generation = newest + 1,
            "garbage collection complete"
        );
        Ok(())
    }
}

impl Drop for UnifiedCache {
    fn drop(&mut self) {
        let _ = self.close_impl(true);
        self.lock.unlock_raw();
    }
}

fn generation_dir(root: &Path, generation: u64) -> PathBuf {
    root.join(format!("{GEN_PREFIX}{generation}"))
}

/// Generation numbers present under `root`, ascending.
fn list_generations(root: &Path) -> Result<Vec<u64>> {
    let mut generations = vec![];
    let entries = std::fs::read_dir(root).map_err(|e| StoreError::io(root, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(root, e))?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(number) = name.to_string_lossy().strip_prefix(GEN_PREFIX).map(str::to_owned)
        else {
            continue;
        };
        if let Ok(number) = number.parse::<u64>() {
            generations.push(number);
        }
    }
    generations.sort_unstable();
    Ok(generations)
}

fn read_settings(root: &Path) -> Result<Option<CacheSettings>> {
    let path = root.join(SETTINGS_FILE);
    let body = match std::fs::read_to_string(&path) {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(&path, e)),
    };
    let settings =
        serde_json::from_str(&body).map_err(|e| StoreError::corrupt(&path, e.to_string()))?;
    Ok(Some(settings))
}

/// The generation number recorded in the needs-gc marker, if set.
fn read_gc_marker(root: &Path) -> Result<Option<u64>> {
    let path = root.join(NEEDS_GC_FILE);
    let body = match std::fs::read_to_string(&path) {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(&path, e)),
    };
    let flagged = body
        .trim()
        .parse::<u64>()
        .map_err(|_| StoreError::corrupt(&path, "unreadable generation number"))?;
    Ok(Some(flagged))
}

fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(dir, e)),
    }
}
