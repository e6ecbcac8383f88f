//! Process-shared mapped log files with bump-pointer allocation.
//!
//! Every store file in the engine is a sparse file grown to its full
//! capacity up front and mapped whole. The first sixteen bytes are a fixed
//! header: a magic word identifying the file kind, then the committed
//! length, maintained as an atomic inside the mapping so that readers in
//! any process observe a consistent prefix without taking locks. Appends
//! write payload bytes first and publish the new committed length with a
//! release store, so a torn record is never visible.
//!
//! File layout:
//! ```text
//! [ magic: u64 ][ committed: atomic u64 ][ user header ... ][ appended records ... ]
//! ```
//!
//! Each open mapping holds a shared `flock` on its file. On drop, if an
//! exclusive lock can be grabbed without waiting (meaning no other mapping
//! exists in any process), the sparse file is shrunk back down to its
//! committed length.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use memmap2::MmapRaw;

use crate::error::{Result, StoreError};

/// Size of the fixed header: magic + committed length.
pub const HEADER_SIZE: u64 = 16;

/// Environment variable overriding the default mapping capacity.
pub const MAX_MAPPING_SIZE_VAR: &str = "LLVM_CAS_MAX_MAPPING_SIZE";

/// Default capacity ceiling for each mapped file. The files are sparse, so
/// this costs address space, not disk.
pub const DEFAULT_MAX_MAPPING_SIZE: u64 = 16 * 1024 * 1024 * 1024;

/// Round up to the engine-wide 8-byte allocation alignment.
pub const fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

fn parse_max_mapping_size(value: Option<&str>) -> std::result::Result<Option<u64>, ()> {
    let Some(value) = value else { return Ok(None) };
    match value.trim().parse::<u64>() {
        Ok(0) => Ok(None),
        Ok(n) => Ok(Some(n)),
        Err(_) => Err(()),
    }
}

/// The mapping capacity ceiling, honoring `LLVM_CAS_MAX_MAPPING_SIZE`.
///
/// Parsed once per process; a non-integer value is an error on first use.
pub fn max_mapping_size() -> Result<u64> {
    static CACHED: OnceLock<std::result::Result<Option<u64>, ()>> = OnceLock::new();
    let parsed = CACHED.get_or_init(|| {
        parse_max_mapping_size(std::env::var(MAX_MAPPING_SIZE_VAR).ok().as_deref())
    });
    match parsed {
        Ok(Some(n)) => Ok(*n),
        Ok(None) => Ok(DEFAULT_MAX_MAPPING_SIZE),
        Err(()) => Err(StoreError::InvalidEnvOverride {
            var: MAX_MAPPING_SIZE_VAR,
        }),
    }
}

/// An owned mapping of one store file.
///
/// Thread-safe. Multiple processes may map the same file concurrently;
/// appends must additionally be serialized by the owning store's write
/// lock. Opening the same file twice within one process is supported but
/// wasteful; prefer sharing one instance.
#[derive(Debug)]
pub struct MappedFile {
    map: MmapRaw,
    file: File,
    path: PathBuf,
}

impl MappedFile {
    /// Open or create the file at `path`.
    ///
    /// On creation the file is grown (sparsely) to `capacity`, `magic` and
    /// `user_header` are written, and the committed length starts just past
    /// the user header. On reopen the magic word is validated and the file
    /// is re-grown to `capacity` if a previous close shrank it.
    pub fn open(path: &Path, magic: u64, capacity: u64, user_header: &[u8]) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;

        let io = |e| StoreError::io(path, e);
        let mut len = file.metadata().map_err(io)?.len();
        if len == 0 {
            // Race to initialize. The exclusive lock is dropped before the
            // long-lived shared lock below is taken, so losers are not
            // blocked behind the winner's instance lifetime.
            flock(&file, libc::LOCK_EX).map_err(io)?;
            len = file.metadata().map_err(io)?.len();
            if len == 0 {
                file.set_len(capacity).map_err(io)?;
                file.write_all_at(&magic.to_le_bytes(), 0).map_err(io)?;
                file.write_all_at(user_header, HEADER_SIZE).map_err(io)?;
                let committed = HEADER_SIZE + align8(user_header.len() as u64);
                file.write_all_at(&committed.to_le_bytes(), 8).map_err(io)?;
                file.sync_data().map_err(io)?;
            }
            flock(&file, libc::LOCK_UN).map_err(io)?;
        }

        // Held for the lifetime of the mapping; gates shrink-on-close.
        flock(&file, libc::LOCK_SH).map_err(io)?;
        len = file.metadata().map_err(io)?.len();
        if len < capacity {
            // Growing is safe with concurrent mappers; shrinking only
            // happens under an exclusive lock, which our shared lock
            // excludes from here on.
            file.set_len(capacity).map_err(io)?;
        }

        let map = MmapRaw::map_raw(&file).map_err(io)?;
        let mf = Self {
            map,
            file,
            path: path.to_path_buf(),
        };

        if mf.read_u64(0) != magic {
            return Err(StoreError::BadMagic {
                path: mf.path.clone(),
            });
        }
        let committed = mf.committed();
        if committed < HEADER_SIZE || committed > mf.capacity() {
            return Err(StoreError::corrupt(
                &mf.path,
                format!("committed length {committed} out of range"),
            ));
        }
        Ok(mf)
    }

    /// The path this mapping was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total mapped capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.map.len() as u64
    }

    fn committed_word(&self) -> &AtomicU64 {
        // The committed word lives at offset 8 and is always mapped.
        unsafe { &*(self.map.as_mut_ptr().add(8) as *const AtomicU64) }
    }

    /// Bytes of the file that contain published data, header included.
    pub fn committed(&self) -> u64 {
        self.committed_word().load(Ordering::Acquire)
    }

    fn read_u64(&self, offset: u64) -> u64 {
        debug_assert!(offset % 8 == 0 && offset + 8 <= self.capacity());
        unsafe { (self.map.as_mut_ptr().add(offset as usize) as *const u64).read() }
    }

    /// A view of the `len` user-header bytes written at creation.
    pub fn user_header(&self, len: usize) -> Result<&[u8]> {
        self.slice(HEADER_SIZE, len as u64)
    }

    /// A read-only view of committed bytes at `offset`.
    pub fn slice(&self, offset: u64, len: u64) -> Result<&[u8]> {
        let end = offset.checked_add(len).ok_or_else(|| {
            StoreError::corrupt(&self.path, format!("offset overflow at {offset}"))
        })?;
        if end > self.committed() {
            return Err(StoreError::corrupt(
                &self.path,
                format!("read of {len} bytes at {offset} past committed length"),
            ));
        }
        Ok(unsafe {
            std::slice::from_raw_parts(self.map.as_mut_ptr().add(offset as usize), len as usize)
        })
    }

    /// An atomic u64 embedded in committed data, for in-place publication.
    pub fn atomic_u64(&self, offset: u64) -> Result<&AtomicU64> {
        if offset % 8 != 0 || offset + 8 > self.committed() {
            return Err(StoreError::corrupt(
                &self.path,
                format!("bad atomic slot offset {offset}"),
            ));
        }
        Ok(unsafe { &*(self.map.as_mut_ptr().add(offset as usize) as *const AtomicU64) })
    }

    /// Append `bytes`, returning the offset they were written at.
    ///
    /// The caller must hold the owning store's exclusive write lock. The
    /// committed length is published only after the bytes are in place, so
    /// lock-free readers never see a partial record.
    pub fn append(&self, bytes: &[u8]) -> Result<u64> {
        let offset = self.committed();
        debug_assert!(offset % 8 == 0);
        let end = align8(offset + bytes.len() as u64);
        if end > self.capacity() {
            return Err(StoreError::CapacityExceeded {
                path: self.path.clone(),
                needed: end - offset,
                available: self.capacity() - offset,
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.map.as_mut_ptr().add(offset as usize),
                bytes.len(),
            );
        }
        self.committed_word().store(end, Ordering::Release);
        Ok(offset)
    }

    /// Flush dirty pages back to the file.
    pub fn flush(&self) -> Result<()> {
        self.map.flush().map_err(|e| StoreError::io(&self.path, e))
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        let _ = self.map.flush();
        let committed = self.committed();
        let _ = flock(&self.file, libc::LOCK_UN);
        // Last mapping out shrinks the sparse file to its real size.
        if flock(&self.file, libc::LOCK_EX | libc::LOCK_NB).is_ok() {
            let _ = self.file.set_len(committed);
        }
    }
}

fn flock(file: &File, op: libc::c_int) -> std::io::Result<()> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
