//! Advisory file locking shared across processes.
//!
//! All cross-process mutual exclusion in the engine goes through `flock(2)`.
//! Two flavors: shared (observers that need a consistent snapshot) and
//! exclusive (structural mutation). Contended acquisition polls once per
//! millisecond up to a caller-supplied timeout so writers can apply their own
//! backoff policy instead of blocking indefinitely.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{Result, StoreError};

/// Which flavor of advisory lock to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Non-exclusive; any number of holders.
    Shared,
    /// Exclusive; blocks out all other holders.
    Exclusive,
}

impl LockKind {
    fn op(self) -> libc::c_int {
        match self {
            LockKind::Shared => libc::LOCK_SH,
            LockKind::Exclusive => libc::LOCK_EX,
        }
    }
}

/// A file used solely for advisory locking.
///
/// Locks are tied to this open file description: dropping the `LockFile`
/// releases anything still held. Scoped acquisitions return a [`LockGuard`]
/// that releases on all exit paths; lifetime-of-the-owner locks use the
/// `*_raw` variants and are released explicitly or on drop.
#[derive(Debug)]
pub struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    /// Open (creating if needed) a lock file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// The path of the underlying lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flock(&self, op: libc::c_int) -> std::io::Result<()> {
        // flock is thread-safe; the lock belongs to the open file description.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), op) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    /// Block until the lock is acquired.
    pub fn lock(&self, kind: LockKind) -> Result<LockGuard<'_>> {
        self.lock_raw(kind)?;
        Ok(LockGuard { lock: self })
    }

    /// Poll every millisecond until the lock is acquired or `timeout` passes.
    pub fn try_lock(&self, kind: LockKind, timeout: Duration) -> Result<LockGuard<'_>> {
        self.try_lock_raw(kind, timeout)?;
        Ok(LockGuard { lock: self })
    }

    /// Acquire without a guard; the holder is responsible for `unlock_raw`.
    ///
    /// Calling this while already holding a lock on the same `LockFile`
    /// converts it (e.g. exclusive down to shared).
    pub fn lock_raw(&self, kind: LockKind) -> Result<()> {
        self.flock(kind.op())
            .map_err(|e| StoreError::io(&self.path, e))
    }

    /// Non-blocking variant of [`LockFile::lock_raw`] with a poll loop.
    pub fn try_lock_raw(&self, kind: LockKind, timeout: Duration) -> Result<()> {
        let op = kind.op() | libc::LOCK_NB;
        let deadline = Instant::now() + timeout;
        loop {
            match self.flock(op) {
                Ok(()) => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EWOULDBLOCK) => {
                    if Instant::now() >= deadline {
                        return Err(StoreError::NoLockAvailable {
                            path: self.path.clone(),
                            waited_ms: timeout.as_millis() as u64,
                        });
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(StoreError::io(&self.path, e)),
            }
        }
    }

    /// Release whatever this file description currently holds.
    pub fn unlock_raw(&self) {
        let _ = self.flock(libc::LOCK_UN);
    }
}

/// Scoped lock holder; releases on drop, including error paths.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a LockFile,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_raw();
    }
}
