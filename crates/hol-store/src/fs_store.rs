use std::fmt;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use hol_cbor::{Hash, to_canonical_cbor};

use crate::{EntryKind, Store, StoreError, StoreResult, io_error};

/// Directory store. Entries live at `<root>/<kind>/<first two hex>/<rest>`,
/// written to a temporary name and renamed into place so a reader never sees
/// a partial entry.
#[derive(Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl fmt::Debug for FsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FsStore").field(&self.root).finish()
    }
}

impl FsStore {
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        for kind in [EntryKind::Node, EntryKind::Blob] {
            let dir = root.join(dir_name(kind));
            fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot blobs currently on disk.
    pub fn blob_count(&self) -> StoreResult<usize> {
        let dir = self.root.join(dir_name(EntryKind::Blob));
        let mut count = 0;
        for shard in fs::read_dir(&dir).map_err(|e| io_error(&dir, e))? {
            let shard = shard.map_err(|e| io_error(&dir, e))?.path();
            if shard.is_dir() {
                count += fs::read_dir(&shard)
                    .map_err(|e| io_error(&shard, e))?
                    .filter_map(Result::ok)
                    .filter(|entry| !is_temp(&entry.path()))
                    .count();
            }
        }
        Ok(count)
    }

    fn path_for(&self, kind: EntryKind, hash: &Hash) -> PathBuf {
        let hex = hex::encode(hash.as_bytes());
        let (shard, rest) = hex.split_at(2);
        self.root.join(dir_name(kind)).join(shard).join(rest)
    }

    fn write(&self, kind: EntryKind, hash: &Hash, bytes: &[u8]) -> StoreResult<()> {
        let path = self.path_for(kind, hash);
        if path.exists() {
            return Ok(());
        }
        let shard = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(shard).map_err(|e| io_error(shard, e))?;
        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp).map_err(|e| io_error(&tmp, e))?;
        file.write_all(bytes).map_err(|e| io_error(&tmp, e))?;
        file.sync_all().map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| io_error(&path, e))
    }

    fn read(&self, kind: EntryKind, hash: Hash) -> StoreResult<Vec<u8>> {
        let path = self.path_for(kind, &hash);
        let bytes = fs::read(&path).map_err(|err| match err.kind() {
            ErrorKind::NotFound => StoreError::NotFound { kind, hash },
            _ => io_error(&path, err),
        })?;
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
}

fn dir_name(kind: EntryKind) -> &'static str {
    match kind {
        EntryKind::Node => "nodes",
        EntryKind::Blob => "snapshots",
    }
}

fn is_temp(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "tmp")
}

impl Store for FsStore {
    fn put_node<T: serde::Serialize>(&self, value: &T) -> StoreResult<Hash> {
        let bytes = to_canonical_cbor(value)?;
        let hash = Hash::of_bytes(&bytes);
        self.write(EntryKind::Node, &hash, &bytes)?;
        Ok(hash)
    }

    fn get_node<T: serde::de::DeserializeOwned>(&self, hash: Hash) -> StoreResult<T> {
        let bytes = self.read(EntryKind::Node, hash)?;
        Ok(serde_cbor::from_slice(&bytes)?)
    }

    fn put_blob(&self, bytes: &[u8]) -> StoreResult<Hash> {
        let hash = Hash::of_bytes(bytes);
        self.write(EntryKind::Blob, &hash, bytes)?;
        Ok(hash)
    }

    fn get_blob(&self, hash: Hash) -> StoreResult<Vec<u8>> {
        self.read(EntryKind::Blob, hash)
    }

    fn has_blob(&self, hash: Hash) -> StoreResult<bool> {
        Ok(self.path_for(EntryKind::Blob, &hash).is_file())
    }

    fn delete_blob(&self, hash: Hash) -> StoreResult<bool> {
        let path = self.path_for(EntryKind::Blob, &hash);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_error(path, err)),
        }
    }
}
