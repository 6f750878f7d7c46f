//! Content-addressed storage for anchor snapshots and compaction summaries, with
//! filesystem and in-memory backends.

mod fs_store;
mod mem_store;

pub use fs_store::FsStore;
pub use mem_store::MemStore;

use hol_cbor::Hash;
use serde::{Serialize, de::DeserializeOwned};
use std::{io, path::PathBuf};

pub type StoreResult<T> = Result<T, StoreError>;

/// Trait implemented by all content-addressed stores.
///
/// Blobs are immutable once written. `delete_blob` exists only for snapshot
/// demotion and pruning; callers must keep a replay path to every state a
/// deleted blob described.
pub trait Store: Send + Sync {
    fn put_node<T: Serialize>(&self, value: &T) -> StoreResult<Hash>;
    fn get_node<T: DeserializeOwned>(&self, hash: Hash) -> StoreResult<T>;

    fn put_blob(&self, bytes: &[u8]) -> StoreResult<Hash>;
    fn get_blob(&self, hash: Hash) -> StoreResult<Vec<u8>>;
    fn has_blob(&self, hash: Hash) -> StoreResult<bool>;
    /// Returns whether a blob was present.
    fn delete_blob(&self, hash: Hash) -> StoreResult<bool>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CBOR serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("hash mismatch for {kind:?}: expected {expected}, got {actual}")]
    HashMismatch {
        kind: EntryKind,
        expected: Hash,
        actual: Hash,
    },
    #[error("{kind:?} {hash} not found")]
    NotFound { kind: EntryKind, hash: Hash },
}

impl StoreError {
    /// True when stored bytes no longer match their address.
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::HashMismatch { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Node,
    Blob,
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source: err,
    }
}
