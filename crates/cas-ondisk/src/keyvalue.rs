//! Fixed-size-key index with first-writer-wins semantics.
//!
//! Backed by a single mapped file of fixed-stride entries:
//!
//! ```text
//! {dir}/
//! ├── keys.dat    # [key][pad to 8][u64 value], append-only
//! └── kvlock      # write serialization across processes
//! ```
//!
//! Keys are fixed-size at creation (in practice content digests); values
//! are bare `u64` words, which in the unified cache are object ids in the
//! owning generation's store. There is no delete and no overwrite: the
//! first value stored for a key wins, and every later `put` for that key
//! observes the winner instead of its own value. Entries become visible
//! only after the mapped file's committed length is published, so a reader
//! never sees a half-written pair.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use tracing::trace;

use crate::error::{Result, StoreError};
use crate::lockfile::{LockFile, LockKind};
use crate::mapped_file::{align8, max_mapping_size, MappedFile, HEADER_SIZE};

const KV_MAGIC: u64 = u64::from_le_bytes(*b"caskvdb\0");
const FORMAT_VERSION: u32 = 1;

/// User header: version + key size + reserved word.
const KV_HEADER_LEN: usize = 16;

const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct SeenKeys {
    by_key: HashMap<Box<[u8]>, u64>,
    scanned: u64,
}

/// Durable, process-shared map from fixed-size keys to `u64` values.
pub struct KeyValueStore {
    path: PathBuf,
    key_size: usize,
    map: MappedFile,
    write_lock: LockFile,
    seen: Mutex<SeenKeys>,
}

impl KeyValueStore {
    /// Open or create a key-value index in `dir`.
    pub fn open(dir: &Path, key_size: usize) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        let path = dir.join("keys.dat");

        let mut header = [0u8; KV_HEADER_LEN];
        header[..4].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        header[4..8].copy_from_slice(&(key_size as u32).to_le_bytes());

        let map = MappedFile::open(&path, KV_MAGIC, max_mapping_size()?, &header)?;
        let write_lock = LockFile::open(&dir.join("kvlock"))?;

        let store = Self {
            path,
            key_size,
            map,
            write_lock,
            seen: Mutex::new(SeenKeys::default()),
        };
        store.validate_header(key_size)?;
        Ok(store)
    }

    fn validate_header(&self, key_size: usize) -> Result<()> {
        let header = self.map.user_header(KV_HEADER_LEN)?;
        let version = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if version != FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                path: self.path.clone(),
                expected: FORMAT_VERSION,
                found: version,
            });
        }
        let found_key = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if found_key != key_size {
            return Err(StoreError::HashSchemaMismatch {
                path: self.path.clone(),
                expected: format!("key size {key_size}"),
                found: format!("key size {found_key}"),
            });
        }
        Ok(())
    }

    fn key_slot(&self) -> u64 {
        align8(self.key_size as u64)
    }

    fn entry_stride(&self) -> u64 {
        self.key_slot() + 8
    }

    fn entries_start(&self) -> u64 {
        HEADER_SIZE + align8(KV_HEADER_LEN as u64)
    }

    fn entry_offset(&self, index: u64) -> u64 {
        self.entries_start() + index * self.entry_stride()
    }

    /// Entries stored so far, across all processes.
    pub fn num_entries(&self) -> u64 {
        (self.map.committed() - self.entries_start()) / self.entry_stride()
    }

    /// Committed on-disk bytes.
    pub fn size(&self) -> u64 {
        self.map.committed()
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_size {
            return Err(StoreError::InvalidDigestSize {
                expected: self.key_size,
                got: key.len(),
            });
        }
        Ok(())
    }

    fn refresh(&self, seen: &mut SeenKeys) -> Result<()> {
        let total = self.num_entries();
        while seen.scanned < total {
            let i = seen.scanned;
            let key = self.map.slice(self.entry_offset(i), self.key_size as u64)?;
            // First writer wins; a duplicate append never shadows the original.
            seen.by_key.entry(key.into()).or_insert(i);
            seen.scanned += 1;
        }
        Ok(())
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<u64>> {
        let mut seen = self.seen.lock().unwrap();
        if let Some(&i) = seen.by_key.get(key) {
            return Ok(Some(i));
        }
        self.refresh(&mut seen)?;
        Ok(seen.by_key.get(key).copied())
    }

    fn value_at(&self, entry: u64) -> Result<u64> {
        let b = self
            .map
            .slice(self.entry_offset(entry) + self.key_slot(), 8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// The value stored for `key`, if any. Lock-free.
    pub fn get(&self, key: &[u8]) -> Result<Option<u64>> {
        self.check_key(key)?;
        match self.lookup(key)? {
            Some(entry) => Ok(Some(self.value_at(entry)?)),
            None => Ok(None),
        }
    }

    /// Store `value` for `key` and return the winning value.
    ///
    /// If another writer got there first the stored value is returned
    /// unchanged; callers must treat the return value, not their argument,
    /// as the binding.
    pub fn put(&self, key: &[u8], value: u64) -> Result<u64> {
        self.check_key(key)?;
        if let Some(entry) = self.lookup(key)? {
            return self.value_at(entry);
        }

        let _guard = self
            .write_lock
            .try_lock(LockKind::Exclusive, WRITE_LOCK_TIMEOUT)?;
        // Rescan under the lock; a racing writer may have won.
        if let Some(entry) = self.lookup(key)? {
            return self.value_at(entry);
        }

        let mut record = vec![0u8; self.entry_stride() as usize];
        record[..self.key_size].copy_from_slice(key);
        let slot = self.key_slot() as usize;
        record[slot..slot + 8].copy_from_slice(&value.to_le_bytes());
        let offset = self.map.append(&record)?;
        let entry = (offset - self.entries_start()) / self.entry_stride();
        trace!(entry, value, "stored key-value binding");

        let mut seen = self.seen.lock().unwrap();
        seen.by_key.insert(key.into(), entry);
        Ok(value)
    }

    /// Visit every binding in insertion order.
    pub fn for_each(&self, mut f: impl FnMut(&[u8], u64) -> Result<()>) -> Result<()> {
        let total = self.num_entries();
        for i in 0..total {
            let key = self.map.slice(self.entry_offset(i), self.key_size as u64)?;
            let value = self.value_at(i)?;
            f(key, value)?;
        }
        Ok(())
    }

    /// Flush the mapping back to disk.
    pub fn flush(&self) -> Result<()> {
        self.map.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_kv(dir: &Path) -> KeyValueStore {
        KeyValueStore::open(dir, 32).unwrap()
    }

    fn key(label: &str) -> Vec<u8> {
        blake3::hash(label.as_bytes()).as_bytes().to_vec()
    }

    #[test]
    fn test_put_then_get() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let kv = open_kv(dir.path());

        let k = key("action");
        assert_eq!(kv.put(&k, 7)?, 7);
        assert_eq!(kv.get(&k)?, Some(7));
        Ok(())
    }

    #[test]
    fn test_get_missing_is_none() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let kv = open_kv(dir.path());
        assert_eq!(kv.get(&key("never stored"))?, None);
        Ok(())
    }

    #[test]
    fn test_zero_is_a_valid_value() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let kv = open_kv(dir.path());

        let k = key("zeroth object");
        assert_eq!(kv.put(&k, 0)?, 0);
        assert_eq!(kv.get(&k)?, Some(0));
        Ok(())
    }

    #[test]
    fn test_first_writer_wins() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let kv = open_kv(dir.path());

        let k = key("contested");
        assert_eq!(kv.put(&k, 1)?, 1);
        // The losing put observes the winner, not its own value.
        assert_eq!(kv.put(&k, 2)?, 1);
        assert_eq!(kv.get(&k)?, Some(1));
        assert_eq!(kv.num_entries(), 1);
        Ok(())
    }

    #[test]
    fn test_first_writer_wins_across_instances() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let a = open_kv(dir.path());
        let b = open_kv(dir.path());

        let k = key("shared");
        assert_eq!(a.put(&k, 10)?, 10);
        // b opened before a's write; its put must still lose.
        assert_eq!(b.put(&k, 20)?, 10);
        assert_eq!(b.get(&k)?, Some(10));
        Ok(())
    }

    /// Child half of `test_first_writer_wins_across_processes`; only does
    /// anything when re-executed by the parent with the directory in the
    /// environment.
    #[test]
    #[ignore]
    fn cross_process_loser() {
        let Ok(dir) = std::env::var("CAS_ONDISK_KV_DIR") else {
            return;
        };
        let kv = open_kv(Path::new(&dir));
        // The parent bound this key first; the put must observe its value.
        assert_eq!(kv.put(&key("raced across processes"), 2).unwrap(), 1);
    }

    #[test]
    fn test_first_writer_wins_across_processes() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let kv = open_kv(dir.path());
        let k = key("raced across processes");
        assert_eq!(kv.put(&k, 1)?, 1);

        // Re-run this test binary as a real second process that races the
        // same key.
        let exe = std::env::current_exe().unwrap();
        let status = std::process::Command::new(exe)
            .args(["keyvalue::tests::cross_process_loser", "--exact", "--ignored"])
            .env("CAS_ONDISK_KV_DIR", dir.path())
            .status()
            .unwrap();
        assert!(status.success());

        assert_eq!(kv.get(&k)?, Some(1));
        assert_eq!(kv.num_entries(), 1);
        Ok(())
    }

    #[test]
    fn test_wrong_key_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let kv = open_kv(dir.path());

        assert!(matches!(
            kv.get(&[0u8; 8]),
            Err(StoreError::InvalidDigestSize { .. })
        ));
        assert!(matches!(
            kv.put(&[0u8; 8], 1),
            Err(StoreError::InvalidDigestSize { .. })
        ));
    }

    #[test]
    fn test_key_size_mismatch_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            open_kv(dir.path());
        }
        let err = KeyValueStore::open(dir.path(), 20);
        assert!(matches!(err, Err(StoreError::HashSchemaMismatch { .. })));
    }

    #[test]
    fn test_persistence_across_reopen() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let k = key("durable");
        {
            let kv = open_kv(dir.path());
            kv.put(&k, 99)?;
        }
        let kv = open_kv(dir.path());
        assert_eq!(kv.get(&k)?, Some(99));
        Ok(())
    }

    #[test]
    fn test_for_each_sees_all_bindings() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let kv = open_kv(dir.path());

        for i in 0..5u64 {
            kv.put(&key(&format!("k{i}")), i)?;
        }
        let mut seen = vec![];
        kv.for_each(|k, v| {
            assert_eq!(k.len(), 32);
            seen.push(v);
            Ok(())
        })?;
        // Insertion order.
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn test_concurrent_puts_agree() -> Result<()> {
        use std::sync::Arc;
        use std::thread;

        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(open_kv(dir.path()));
        let k = key("raced");

        let mut handles = vec![];
        for i in 0..8u64 {
            let kv = kv.clone();
            let k = k.clone();
            handles.push(thread::spawn(move || kv.put(&k, i).expect("put")));
        }
        let winners: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // Everyone observed the same winner.
        assert!(winners.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(kv.num_entries(), 1);
        Ok(())
    }
}
