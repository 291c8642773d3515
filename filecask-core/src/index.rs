//! Durable repository index
//!
//! One sled database holds every persisted state record of the repository.
//! Keys are a single-byte type tag followed by the body, so all entries of
//! one kind can be prefix-scanned:
//!
//! - `f` + hash  → `FilePosition` (live file entries)
//! - `r` + hash  → `FilePosition` (soft-deleted removal candidates)
//! - `b` + index → `BlockFileInfo`
//! - `l`         → last block file index
//! - `s`         → `RepositoryAggregateState`
//! - `y`         → `SyncState`
//!
//! Related mutations are staged in an [`IndexBatch`] and applied atomically;
//! the manager pairs each applied batch with an explicit [`sync`] at defined
//! checkpoints.
//!
//! [`sync`]: RepositoryIndex::sync

use crate::block_store::FilePosition;
use crate::error::{RepositoryError, Result};
use crate::hash::ContentHash;
use crate::state::{BlockFileInfo, RepositoryAggregateState, SyncState};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;

const TAG_FILE: u8 = b'f';
const TAG_REMOVED: u8 = b'r';
const TAG_BLOCK_INFO: u8 = b'b';
const KEY_LAST_BLOCK: &[u8] = b"l";
const KEY_AGGREGATE: &[u8] = b"s";
const KEY_SYNC_STATE: &[u8] = b"y";

fn hash_key(tag: u8, hash: &ContentHash) -> [u8; 33] {
    let mut key = [0u8; 33];
    key[0] = tag;
    key[1..].copy_from_slice(hash.as_bytes());
    key
}

fn block_info_key(index: u32) -> [u8; 5] {
    let mut key = [0u8; 5];
    key[0] = TAG_BLOCK_INFO;
    key[1..].copy_from_slice(&index.to_be_bytes());
    key
}

fn decode<T: DeserializeOwned>(value: &[u8]) -> Result<T> {
    bincode::deserialize(value).map_err(|e| RepositoryError::Serialization(e.to_string()))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| RepositoryError::Serialization(e.to_string()))
}

/// The durable `ContentHash -> FilePosition` map plus the persisted state
/// records, over one sled database.
pub struct RepositoryIndex {
    db: sled::Db,
}

impl RepositoryIndex {
    /// Open or create the index under `<dir>/index`.
    pub fn open(dir: &Path) -> Result<Self> {
        let db = sled::open(dir.join("index"))?;
        Ok(Self { db })
    }

    /// An in-memory index that never touches disk, for tests that substitute
    /// the durable store.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Record a live file entry.
    pub fn put_position(&self, hash: &ContentHash, pos: &FilePosition) -> Result<()> {
        self.db.insert(hash_key(TAG_FILE, hash), encode(pos)?)?;
        Ok(())
    }

    /// Look up a live file entry.
    pub fn get_position(&self, hash: &ContentHash) -> Result<Option<FilePosition>> {
        match self.db.get(hash_key(TAG_FILE, hash))? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    /// Drop a live file entry.
    pub fn delete_position(&self, hash: &ContentHash) -> Result<()> {
        self.db.remove(hash_key(TAG_FILE, hash))?;
        Ok(())
    }

    /// Iterate all live `(hash, position)` entries in key order.
    pub fn live_entries(&self) -> impl Iterator<Item = Result<(ContentHash, FilePosition)>> + '_ {
        self.entries_with_tag(TAG_FILE)
    }

    /// Iterate all soft-deleted `(hash, position)` entries in key order.
    pub fn removal_candidates(
        &self,
    ) -> impl Iterator<Item = Result<(ContentHash, FilePosition)>> + '_ {
        self.entries_with_tag(TAG_REMOVED)
    }

    fn entries_with_tag(
        &self,
        tag: u8,
    ) -> impl Iterator<Item = Result<(ContentHash, FilePosition)>> + '_ {
        self.db.scan_prefix([tag]).map(|item| {
            let (key, value) = item?;
            if key.len() != 33 {
                return Err(RepositoryError::Index(format!(
                    "malformed index key of length {}",
                    key.len()
                )));
            }
            let mut hash_bytes = [0u8; 32];
            hash_bytes.copy_from_slice(&key[1..]);
            Ok((ContentHash::new(hash_bytes), decode(&value)?))
        })
    }

    pub fn write_block_info(&self, index: u32, info: &BlockFileInfo) -> Result<()> {
        self.db.insert(block_info_key(index), encode(info)?)?;
        Ok(())
    }

    pub fn read_block_info(&self, index: u32) -> Result<Option<BlockFileInfo>> {
        match self.db.get(block_info_key(index))? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    pub fn write_last_block(&self, index: u32) -> Result<()> {
        self.db.insert(KEY_LAST_BLOCK, encode(&index)?)?;
        Ok(())
    }

    pub fn read_last_block(&self) -> Result<Option<u32>> {
        match self.db.get(KEY_LAST_BLOCK)? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    pub fn read_aggregate(&self) -> Result<Option<RepositoryAggregateState>> {
        match self.db.get(KEY_AGGREGATE)? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    pub fn write_sync_state(&self, state: &SyncState) -> Result<()> {
        self.db.insert(KEY_SYNC_STATE, encode(state)?)?;
        Ok(())
    }

    pub fn read_sync_state(&self) -> Result<Option<SyncState>> {
        match self.db.get(KEY_SYNC_STATE)? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    /// Start an atomic batch of related writes.
    pub fn batch(&self) -> IndexBatch {
        IndexBatch {
            inner: sled::Batch::default(),
        }
    }

    /// Apply a batch atomically. Durability still requires [`sync`].
    ///
    /// [`sync`]: RepositoryIndex::sync
    pub fn apply(&self, batch: IndexBatch) -> Result<()> {
        self.db.apply_batch(batch.inner)?;
        Ok(())
    }

    /// Fsync the index. The manager calls this after each batch of related
    /// writes so that no checkpoint is only partially durable.
    pub fn sync(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Drop the persisted aggregate record to exercise the reindex path.
    #[cfg(test)]
    pub(crate) fn remove_aggregate(&self) -> Result<()> {
        self.db.remove(KEY_AGGREGATE)?;
        Ok(())
    }
}

/// A staged set of index mutations applied atomically by
/// [`RepositoryIndex::apply`].
pub struct IndexBatch {
    inner: sled::Batch,
}

impl IndexBatch {
    pub fn put_position(&mut self, hash: &ContentHash, pos: &FilePosition) -> Result<()> {
        self.inner.insert(&hash_key(TAG_FILE, hash)[..], encode(pos)?);
        Ok(())
    }

    pub fn delete_position(&mut self, hash: &ContentHash) {
        self.inner.remove(&hash_key(TAG_FILE, hash)[..]);
    }

    pub fn put_removal_candidate(&mut self, hash: &ContentHash, pos: &FilePosition) -> Result<()> {
        self.inner.insert(&hash_key(TAG_REMOVED, hash)[..], encode(pos)?);
        Ok(())
    }

    pub fn delete_removal_candidate(&mut self, hash: &ContentHash) {
        self.inner.remove(&hash_key(TAG_REMOVED, hash)[..]);
    }

    pub fn write_block_info(&mut self, index: u32, info: &BlockFileInfo) -> Result<()> {
        self.inner.insert(&block_info_key(index)[..], encode(info)?);
        Ok(())
    }

    pub fn erase_block_info(&mut self, index: u32) {
        self.inner.remove(&block_info_key(index)[..]);
    }

    pub fn write_last_block(&mut self, index: u32) -> Result<()> {
        self.inner.insert(KEY_LAST_BLOCK, encode(&index)?);
        Ok(())
    }

    pub fn write_aggregate(&mut self, state: &RepositoryAggregateState) -> Result<()> {
        self.inner.insert(KEY_AGGREGATE, encode(state)?);
        Ok(())
    }

    pub fn write_sync_state(&mut self, state: &SyncState) -> Result<()> {
        self.inner.insert(KEY_SYNC_STATE, encode(state)?);
        Ok(())
    }
}
