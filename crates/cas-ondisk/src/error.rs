//! Error types for the on-disk storage engine.
//!
//! Every fallible operation surfaces one of these variants. Unknown keys and
//! unknown-but-allocated objects are *not* errors; those come back as `None`
//! from the lookup operations. Lock contention is retried internally with a
//! bounded timeout before surfacing as `NoLockAvailable`.

use std::path::PathBuf;

/// Errors that can occur while operating on an on-disk store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An I/O error occurred while reading or writing store files.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A store file does not start with the expected magic bytes.
    #[error("{path} is not a recognized store file")]
    BadMagic {
        /// The offending file.
        path: PathBuf,
    },

    /// A store file was written by an incompatible format version.
    #[error("format version mismatch in {path}: expected {expected}, found {found}")]
    VersionMismatch {
        /// The offending file.
        path: PathBuf,
        /// The version this build understands.
        expected: u32,
        /// The version recorded on disk.
        found: u32,
    },

    /// The store was created with a different hash scheme. Never migrated
    /// automatically; reopen with the original scheme or use a new directory.
    #[error("hash scheme mismatch at {path}: expected {expected}, found {found}")]
    HashSchemaMismatch {
        /// The store directory or file.
        path: PathBuf,
        /// The scheme the caller asked for, as `name/bytes`.
        expected: String,
        /// The scheme recorded on disk.
        found: String,
    },

    /// The cache directory was created with a different fault-in policy.
    #[error("fault-in policy mismatch at {path}: expected {expected}, found {found}")]
    PolicyMismatch {
        /// The cache root directory.
        path: PathBuf,
        /// The policy the caller asked for.
        expected: String,
        /// The policy recorded on disk.
        found: String,
    },

    /// An advisory lock could not be acquired within the timeout.
    #[error("no lock available on {path} after {waited_ms}ms")]
    NoLockAvailable {
        /// The lock file.
        path: PathBuf,
        /// How long we polled before giving up.
        waited_ms: u64,
    },

    /// An append would exceed the mapped capacity of a store file.
    #[error("{path} is full: {needed} bytes needed, {available} available")]
    CapacityExceeded {
        /// The full store file.
        path: PathBuf,
        /// Bytes the operation needed.
        needed: u64,
        /// Bytes remaining before the capacity ceiling.
        available: u64,
    },

    /// An object id that was never handed out by this store.
    #[error("unknown object id {0}")]
    UnknownObjectId(u64),

    /// A digest with the wrong length for this store's hash scheme.
    #[error("invalid digest size: expected {expected} bytes, got {got}")]
    InvalidDigestSize {
        /// The store's digest size.
        expected: usize,
        /// The size the caller supplied.
        got: usize,
    },

    /// On-disk structures that fail internal consistency checks.
    #[error("corrupt store file {path}: {reason}")]
    Corrupt {
        /// The offending file.
        path: PathBuf,
        /// What failed to validate.
        reason: String,
    },

    /// An environment override that failed to parse.
    #[error("invalid value for {var}: expected an integer")]
    InvalidEnvOverride {
        /// The environment variable name.
        var: &'static str,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StoreError::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, StoreError>;
