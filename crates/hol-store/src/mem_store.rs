use crate::{EntryKind, Store, StoreError, StoreResult};
use hol_cbor::{Hash, to_canonical_cbor};
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

type Entries = RwLock<HashMap<Hash, Vec<u8>>>;

/// In-memory store used by tests and by isolated recipe replays.
#[derive(Clone, Default)]
pub struct MemStore {
    nodes: Arc<Entries>,
    blobs: Arc<Entries>,
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStore")
            .field("nodes", &self.nodes.read().unwrap_or_else(PoisonError::into_inner).len())
            .field("blobs", &self.blobs.read().unwrap_or_else(PoisonError::into_inner).len())
            .finish()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Overwrite a blob in place without re-addressing it. Test hook for
    /// corruption scenarios.
    pub fn tamper_blob(&self, hash: Hash, bytes: Vec<u8>) {
        let mut guard = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
        guard.insert(hash, bytes);
    }

    fn load_bytes(map: &Entries, kind: EntryKind, hash: Hash) -> StoreResult<Vec<u8>> {
        let guard = map.read().unwrap_or_else(PoisonError::into_inner);
        let bytes = guard
            .get(&hash)
            .cloned()
            .ok_or(StoreError::NotFound { kind, hash })?;
        let actual = Hash::of_bytes(&bytes);
        if actual != hash {
            return Err(StoreError::HashMismatch {
                kind,
                expected: hash,
                actual,
            });
        }
        Ok(bytes)
    }

    fn insert_if_absent(map: &Entries, hash: Hash, bytes: Vec<u8>) {
        let mut guard = map.write().unwrap_or_else(PoisonError::into_inner);
        guard.entry(hash).or_insert(bytes);
    }
}

impl Store for MemStore {
    fn put_node<T: Serialize>(&self, value: &T) -> StoreResult<Hash> {
        let bytes = to_canonical_cbor(value)?;
        let hash = Hash::of_bytes(&bytes);
        Self::insert_if_absent(&self.nodes, hash, bytes);
        Ok(hash)
    }

    fn get_node<T: DeserializeOwned>(&self, hash: Hash) -> StoreResult<T> {
        let bytes = Self::load_bytes(&self.nodes, EntryKind::Node, hash)?;
        Ok(serde_cbor::from_slice(&bytes)?)
    }

    fn put_blob(&self, bytes: &[u8]) -> StoreResult<Hash> {
        let hash = Hash::of_bytes(bytes);
        Self::insert_if_absent(&self.blobs, hash, bytes.to_vec());
        Ok(hash)
    }

    fn get_blob(&self, hash: Hash) -> StoreResult<Vec<u8>> {
        Self::load_bytes(&self.blobs, EntryKind::Blob, hash)
    }

    fn has_blob(&self, hash: Hash) -> StoreResult<bool> {
        Ok(self
            .blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&hash))
    }

    fn delete_blob(&self, hash: Hash) -> StoreResult<bool> {
        let mut guard = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.remove(&hash).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Summary {
        chain: String,
        retained: Vec<u64>,
    }

    #[test]
    fn node_round_trip() {
        let store = MemStore::new();
        let value = Summary {
            chain: "alpha".into(),
            retained: vec![0, 40, 100],
        };
        let hash = store.put_node(&value).expect("put");
        let loaded: Summary = store.get_node(hash).expect("get");
        assert_eq!(value, loaded);
    }

    #[test]
    fn blob_delete_and_missing() {
        let store = MemStore::new();
        let hash = store.put_blob(b"snapshot").expect("put");
        assert!(store.has_blob(hash).unwrap());
        assert!(store.delete_blob(hash).unwrap());
        assert!(!store.delete_blob(hash).unwrap());
        let err = store.get_blob(hash).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: EntryKind::Blob, .. }));
    }

    #[test]
    fn tampered_blob_is_detected() {
        let store = MemStore::new();
        let hash = store.put_blob(b"original").expect("put");
        store.tamper_blob(hash, b"tampered".to_vec());
        let err = store.get_blob(hash).unwrap_err();
        assert!(err.is_corruption());
    }
}
