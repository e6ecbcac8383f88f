//! Content-addressable storage for build-artifact caching.
//!
//! Clients hash an action (compiler invocation plus inputs) into a
//! [`CacheKey`], bind it to a result digest through an [`ActionCache`],
//! and store the result's object DAG in an [`ObjectStore`]. The digests
//! are full 32-byte BLAKE3 and cover each object's references as well as
//! its payload, so equal digests mean interchangeable subgraphs.
//!
//! Two backends implement the traits: [`OnDiskStore`], persisted in a
//! process-shared cache directory via the `cas-ondisk` engine, and the
//! in-memory pair for tests and unconfigured runs. [`CasOptions`] picks
//! the directory from config or environment and caches open instances
//! process-wide.

pub mod hash;
pub mod memory;
pub mod ondisk;
pub mod options;
pub mod traits;

pub use hash::{CasDigest, DigestError, DIGEST_LEN};
pub use memory::{InMemoryActionCache, InMemoryObjectStore};
pub use ondisk::{OnDiskStore, HASH_NAME};
pub use options::CasOptions;
pub use traits::{ActionCache, CacheKey, LoadedObject, ObjectRef, ObjectStore, StoreStats};

pub use cas_ondisk::{FaultInPolicy, StoreError, UnifiedCache};
