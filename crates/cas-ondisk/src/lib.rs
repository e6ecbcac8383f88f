//! On-disk content-addressable storage engine.
//!
//! A passive, embeddable storage library for build-artifact caching. No
//! threads, no scheduler; callers invoke it synchronously, and correctness
//! holds across any number of threads and OS processes mapping the same
//! directory at once.
//!
//! Three layers:
//!
//! - [`GraphStore`]: durable content-addressed objects (payload + ordered
//!   references), memory-mapped for zero-copy reads.
//! - [`KeyValueStore`]: append-only fixed-size-key index with
//!   first-writer-wins bindings.
//! - [`UnifiedCache`]: one primary store/index pair per directory, an
//!   optional read-through upstream generation, and concurrent-safe
//!   garbage collection.
//!
//! The engine trusts digests: equal digests imply equal content, and it
//! does not defend against adversarial collisions. Hashing itself lives
//! in the caller; the engine only records the hash scheme's name and size
//! so mismatched reopens fail loudly.

mod error;
mod graph;
mod keyvalue;
mod lockfile;
mod mapped_file;
mod unified;

pub use error::{Result, StoreError};
pub use graph::{FaultInPolicy, GraphStore, ObjectHandle, ObjectId, ObjectRefs};
pub use keyvalue::KeyValueStore;
pub use lockfile::{LockFile, LockGuard, LockKind};
pub use mapped_file::{MappedFile, MAX_MAPPING_SIZE_VAR};
pub use unified::UnifiedCache;
