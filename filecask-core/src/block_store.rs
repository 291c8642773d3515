//! Block-file store
//!
//! Byte-level storage of framed records across a numbered sequence of
//! append-only files capped at a maximum size, preallocated in fixed-size
//! chunks. A parallel temp-prefixed sequence exists only during compaction;
//! renaming a temp file onto its original counterpart is the one atomic
//! cross-boundary operation the store offers.

use crate::error::{RepositoryError, Result};
use crate::state::BlockFileInfo;
use fs4::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;
use tracing::{debug, info};

/// Headroom kept free on the volume beyond any preallocation (50 MiB).
const MIN_DISK_HEADROOM: u64 = 50 * 1024 * 1024;

/// Physical location of a framed record.
///
/// The all-zero value is the on-disk "not found" sentinel inherited from the
/// wire format; `size` is part of the check so the first record of a
/// repository (file 0, offset 0) stays addressable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePosition {
    /// Which block file the record lives in.
    pub file_index: u32,
    /// Byte offset of the record's frame within the block file.
    pub offset: u32,
    /// Framed record length (header + payload).
    pub size: u32,
}

impl FilePosition {
    pub fn new(file_index: u32, offset: u32, size: u32) -> Self {
        Self {
            file_index,
            offset,
            size,
        }
    }

    /// The "not found" sentinel.
    pub fn null() -> Self {
        Self::default()
    }

    pub fn is_null(&self) -> bool {
        self.file_index == 0 && self.offset == 0 && self.size == 0
    }
}

impl std::fmt::Display for FilePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.file_index, self.offset)
    }
}

/// Manages the numbered block files under `<dir>/blocks/`.
pub struct BlockFileStore {
    blocks_dir: PathBuf,
    max_file_size: u32,
    chunk_size: u32,
}

impl BlockFileStore {
    /// Create the store, ensuring its directory exists.
    pub fn new(dir: &std::path::Path, max_file_size: u32, chunk_size: u32) -> Result<Self> {
        let blocks_dir = dir.join("blocks");
        fs::create_dir_all(&blocks_dir)?;
        Ok(Self {
            blocks_dir,
            max_file_size,
            chunk_size,
        })
    }

    pub fn max_file_size(&self) -> u32 {
        self.max_file_size
    }

    /// Path of a block file: `blk00000.dat`, or `tmp_blk00000.dat` for the
    /// compaction-only temp sequence.
    pub fn block_path(&self, index: u32, is_tmp: bool) -> PathBuf {
        let name = if is_tmp {
            format!("tmp_blk{:05}.dat", index)
        } else {
            format!("blk{:05}.dat", index)
        };
        self.blocks_dir.join(name)
    }

    /// Open the block file a position addresses, seeking to its offset.
    pub fn open(&self, pos: &FilePosition, read_only: bool, is_tmp: bool) -> Result<File> {
        if pos.is_null() {
            return Err(RepositoryError::Corrupt("open of null position".to_string()));
        }
        self.open_block(pos.file_index, pos.offset, read_only, is_tmp)
    }

    /// Create (or open) a block file without seeking; lays down the first
    /// empty temp file when a compaction pass starts.
    pub fn create_block(&self, index: u32, is_tmp: bool) -> Result<()> {
        self.open_block(index, 0, false, is_tmp)?;
        Ok(())
    }

    fn open_block(&self, index: u32, offset: u32, read_only: bool, is_tmp: bool) -> Result<File> {
        let path = self.block_path(index, is_tmp);
        let mut file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(&path)?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset as u64))?;
        }
        Ok(file)
    }

    /// Find a position for a record of `size` framed bytes in the last block
    /// file, rolling over to a fresh file when the cap would be reached and
    /// extending the file chunk-by-chunk as needed.
    ///
    /// Updates the block info vector and last-block index in place; the two
    /// call sites are the live sequence and the compaction temp sequence.
    pub fn allocate(
        &self,
        infos: &mut Vec<BlockFileInfo>,
        last_block: &mut u32,
        size: u32,
        is_tmp: bool,
        now: i64,
    ) -> Result<FilePosition> {
        if size > self.max_file_size {
            return Err(RepositoryError::RecordTooLarge {
                size,
                max: self.max_file_size,
            });
        }
        if infos.is_empty() {
            infos.push(BlockFileInfo::default());
            *last_block = 0;
        }

        let mut index = *last_block;
        if infos[index as usize].bytes_used as u64 + size as u64 >= self.max_file_size as u64 {
            debug!(block = index, "block file reached cap, rolling over");
            self.flush_block(index, infos[index as usize].bytes_used, true, is_tmp)?;
            infos[index as usize].full = true;
            infos.push(BlockFileInfo::default());
            index += 1;
            *last_block = index;
        }

        let offset = infos[index as usize].bytes_used;
        let pos = FilePosition::new(index, offset, size);

        // extend the file to the next chunk boundary before writing
        let old_chunks = offset.div_ceil(self.chunk_size);
        let new_chunks = (offset + size).div_ceil(self.chunk_size);
        if new_chunks > old_chunks {
            let grow_to = new_chunks as u64 * self.chunk_size as u64;
            let needed = grow_to - offset as u64;
            let available = fs4::available_space(&self.blocks_dir)?;
            if available < needed + MIN_DISK_HEADROOM {
                return Err(RepositoryError::OutOfDiskSpace { needed });
            }
            info!(block = index, up_to = grow_to, is_tmp, "pre-allocating block file");
            let file = self.open_block(index, 0, false, is_tmp)?;
            file.allocate(grow_to)?;
        }

        infos[index as usize].add_record(size, now);
        Ok(pos)
    }

    /// Fsync a block file, optionally truncating trailing preallocated slack
    /// down to its logical used length (rollover and shutdown path).
    pub fn flush_block(&self, index: u32, used: u32, finalize: bool, is_tmp: bool) -> Result<()> {
        let file = self.open_block(index, 0, false, is_tmp)?;
        if finalize {
            file.set_len(used as u64)?;
        }
        file.sync_data()?;
        Ok(())
    }

    /// Atomically replace a block file with its temp counterpart.
    pub fn rename_temp(&self, index: u32) -> Result<()> {
        let tmp = self.block_path(index, true);
        let original = self.block_path(index, false);
        debug!(block = index, "renaming temp block file onto original");
        fs::rename(&tmp, &original)?;
        Ok(())
    }

    /// Unlink a block file.
    pub fn remove_block(&self, index: u32, is_tmp: bool) -> Result<()> {
        let path = self.block_path(index, is_tmp);
        debug!(?path, "removing block file");
        fs::remove_file(&path)?;
        Ok(())
    }

    /// Remove every leftover temp block file, e.g. from a pass that was
    /// aborted before its checkpoint advanced.
    pub fn remove_stale_temp_files(&self) -> Result<()> {
        for entry in fs::read_dir(&self.blocks_dir)? {
            let entry = entry?;
            if entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with("tmp_blk"))
            {
                debug!(path = ?entry.path(), "removing stale temp block file");
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Remove block files numbered beyond `last` that no metadata refers to.
    pub fn remove_blocks_beyond(&self, last: u32) -> Result<()> {
        for entry in fs::read_dir(&self.blocks_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(num) = name
                .strip_prefix("blk")
                .and_then(|n| n.strip_suffix(".dat"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            if num > last {
                debug!(block = num, "removing orphaned block file");
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store(max: u32, chunk: u32) -> (TempDir, BlockFileStore) {
        let tmp = TempDir::new().unwrap();
        let store = BlockFileStore::new(tmp.path(), max, chunk).unwrap();
        (tmp, store)
    }

    #[test]
    fn test_allocate_sequential_offsets() {
        let (_tmp, store) = test_store(10_000, 4096);
        let mut infos = vec![BlockFileInfo::default()];
        let mut last = 0u32;

        let a = store.allocate(&mut infos, &mut last, 1000, false, 0).unwrap();
        let b = store.allocate(&mut infos, &mut last, 2000, false, 0).unwrap();
        assert_eq!(a, FilePosition::new(0, 0, 1000));
        assert_eq!(b, FilePosition::new(0, 1000, 2000));
        assert_eq!(infos[0].bytes_used, 3000);
        assert_eq!(infos[0].records, 2);
    }

    #[test]
    fn test_allocate_rolls_over_at_cap() {
        let (_tmp, store) = test_store(10_000, 4096);
        let mut infos = vec![BlockFileInfo::default()];
        let mut last = 0u32;

        store.allocate(&mut infos, &mut last, 8000, false, 0).unwrap();
        let pos = store.allocate(&mut infos, &mut last, 8000, false, 0).unwrap();

        assert_eq!(pos.file_index, 1);
        assert_eq!(pos.offset, 0);
        assert_eq!(last, 1);
        assert!(infos[0].full);
        assert_eq!(infos.len(), 2);
    }

    #[test]
    fn test_allocate_rejects_oversized_record() {
        let (_tmp, store) = test_store(10_000, 4096);
        let mut infos = vec![BlockFileInfo::default()];
        let mut last = 0u32;

        let err = store
            .allocate(&mut infos, &mut last, 10_001, false, 0)
            .unwrap_err();
        assert!(matches!(err, RepositoryError::RecordTooLarge { .. }));
        assert_eq!(infos[0].records, 0);
    }

    #[test]
    fn test_preallocation_extends_in_chunks() {
        let (_tmp, store) = test_store(1_000_000, 4096);
        let mut infos = vec![BlockFileInfo::default()];
        let mut last = 0u32;

        store.allocate(&mut infos, &mut last, 100, false, 0).unwrap();
        let len = fs::metadata(store.block_path(0, false)).unwrap().len();
        assert_eq!(len, 4096);

        store.allocate(&mut infos, &mut last, 5000, false, 0).unwrap();
        let len = fs::metadata(store.block_path(0, false)).unwrap().len();
        assert_eq!(len, 8192);
    }

    #[test]
    fn test_finalize_truncates_slack() {
        let (_tmp, store) = test_store(1_000_000, 4096);
        let mut infos = vec![BlockFileInfo::default()];
        let mut last = 0u32;

        store.allocate(&mut infos, &mut last, 100, false, 0).unwrap();
        store.flush_block(0, infos[0].bytes_used, true, false).unwrap();
        let len = fs::metadata(store.block_path(0, false)).unwrap().len();
        assert_eq!(len, 100);
    }

    #[test]
    fn test_rename_temp_replaces_original() {
        let (_tmp, store) = test_store(10_000, 4096);
        fs::write(store.block_path(0, false), b"original").unwrap();
        fs::write(store.block_path(0, true), b"temp").unwrap();

        store.rename_temp(0).unwrap();

        assert!(!store.block_path(0, true).exists());
        assert_eq!(fs::read(store.block_path(0, false)).unwrap(), b"temp");
    }

    #[test]
    fn test_remove_stale_temp_files() {
        let (_tmp, store) = test_store(10_000, 4096);
        fs::write(store.block_path(0, true), b"x").unwrap();
        fs::write(store.block_path(3, true), b"y").unwrap();
        fs::write(store.block_path(0, false), b"keep").unwrap();

        store.remove_stale_temp_files().unwrap();

        assert!(!store.block_path(0, true).exists());
        assert!(!store.block_path(3, true).exists());
        assert!(store.block_path(0, false).exists());
    }

    #[test]
    fn test_null_position() {
        assert!(FilePosition::null().is_null());
        // the first record of a repository is not the sentinel
        assert!(!FilePosition::new(0, 0, 56).is_null());
        let err = test_store(10_000, 4096)
            .1
            .open(&FilePosition::null(), true, false)
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Corrupt(_)));
    }
}
