//! Persisted repository state records
//!
//! Three small records mirror the durable bookkeeping: per-block-file usage
//! counters, repository-wide aggregate counters, and the compaction
//! checkpoint. All of them live in the key-value index and are written
//! together with related index mutations at defined checkpoints.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Per-block-file usage counters.
///
/// Created when a new block file is opened, mutated on every add/subtract of
/// a record, and erased only when the file becomes fully empty during
/// compaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockFileInfo {
    /// Number of used bytes in the block file.
    pub bytes_used: u32,
    /// Number of records stored in the block file.
    pub records: u32,
    /// Earliest write time (unix seconds).
    pub first_write: i64,
    /// Latest write time (unix seconds).
    pub last_write: i64,
    /// Set once the file reached the size cap and was finalized.
    pub full: bool,
}

impl BlockFileInfo {
    /// Account for a record of `size` framed bytes added at `now`.
    pub fn add_record(&mut self, size: u32, now: i64) {
        if self.records == 0 {
            self.first_write = now;
        }
        self.records += 1;
        self.bytes_used += size;
        self.last_write = now;
    }

    /// Account for a record of `size` framed bytes leaving the file.
    ///
    /// Underflow means the counters and the disk diverged; log and keep the
    /// counters untouched rather than wrapping.
    pub fn subtract_record(&mut self, size: u32, now: i64) {
        if self.records == 0 || size > self.bytes_used {
            warn!(
                records = self.records,
                bytes_used = self.bytes_used,
                subtract = size,
                "block file counters out of sync, ignoring subtract"
            );
            return;
        }
        self.records -= 1;
        self.bytes_used -= size;
        self.last_write = now;
    }

    /// True when no record occupies the file any more.
    pub fn is_empty(&self) -> bool {
        if (self.bytes_used == 0) != (self.records == 0) {
            warn!(
                records = self.records,
                bytes_used = self.bytes_used,
                "block file counters disagree about emptiness"
            );
        }
        self.bytes_used == 0 && self.records == 0
    }
}

/// Repository-wide usage totals, including soft-deleted bytes that still
/// occupy disk space until a compaction pass reclaims them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryAggregateState {
    /// Total framed bytes of all stored records.
    pub total_bytes: u64,
    /// Number of block files.
    pub block_files: u32,
    /// Number of records across all block files.
    pub records: u64,
    /// Framed bytes of soft-deleted records awaiting compaction.
    pub removal_candidate_bytes: u64,
    /// Number of soft-deleted records awaiting compaction.
    pub removal_candidate_records: u64,
}

impl RepositoryAggregateState {
    /// Account for a newly stored record (does not touch `block_files`).
    pub fn add_record(&mut self, size: u32) {
        self.total_bytes += size as u64;
        self.records += 1;
    }

    /// Account for a record that was soft-deleted (does not touch
    /// `total_bytes`; the bytes remain on disk until compaction).
    pub fn mark_removed(&mut self, size: u32) {
        self.removal_candidate_bytes += size as u64;
        self.removal_candidate_records += 1;
    }

    /// True once soft-deleted bytes exceed `shrink_percent` of the total.
    pub fn needs_compaction(&self, shrink_percent: u32) -> bool {
        self.removal_candidate_bytes > self.total_bytes * shrink_percent as u64 / 100
    }

    /// Recompute totals from the per-block counters. Used when the persisted
    /// aggregate record is missing; removal candidates restart at zero and
    /// are re-discovered by the next expiration sweep.
    pub fn reindex(infos: &[BlockFileInfo]) -> Self {
        let mut state = Self::default();
        for info in infos {
            state.total_bytes += info.bytes_used as u64;
            state.records += info.records as u64;
        }
        state.block_files = infos.len() as u32;
        state
    }
}

/// Persisted checkpoint for an in-progress compaction.
///
/// The null state (`active == false`, both counters -1) means no compaction
/// is in progress. A non-null state at startup signals an interrupted pass
/// that must be finished before normal operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    /// Whether a compaction pass is in progress.
    pub active: bool,
    /// Highest source block file already drained and unlinked.
    pub last_source_block: i32,
    /// Highest temp block file finalized (rolled over); records written to
    /// it are durably indexed at their new positions.
    pub last_temp_block: i32,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            active: false,
            last_source_block: -1,
            last_temp_block: -1,
        }
    }
}

impl SyncState {
    /// The checkpoint written when a compaction pass starts.
    pub fn begin() -> Self {
        Self {
            active: true,
            last_source_block: -1,
            last_temp_block: -1,
        }
    }

    /// True when no compaction is in progress.
    pub fn is_null(&self) -> bool {
        !self.active && self.last_source_block == -1 && self.last_temp_block == -1
    }

    /// Reset to the null state.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_info_add_subtract() {
        let mut info = BlockFileInfo::default();
        info.add_record(100, 10);
        info.add_record(50, 20);
        assert_eq!(info.bytes_used, 150);
        assert_eq!(info.records, 2);
        assert_eq!(info.first_write, 10);
        assert_eq!(info.last_write, 20);

        info.subtract_record(100, 30);
        assert_eq!(info.bytes_used, 50);
        assert_eq!(info.records, 1);
        assert!(!info.is_empty());

        info.subtract_record(50, 40);
        assert!(info.is_empty());
    }

    #[test]
    fn test_block_info_subtract_underflow_ignored() {
        let mut info = BlockFileInfo::default();
        info.add_record(10, 0);
        info.subtract_record(100, 0);
        assert_eq!(info.bytes_used, 10);
        assert_eq!(info.records, 1);
    }

    #[test]
    fn test_needs_compaction_threshold() {
        let mut state = RepositoryAggregateState::default();
        assert!(!state.needs_compaction(25));

        state.add_record(1000);
        assert!(!state.needs_compaction(25));

        state.mark_removed(250);
        // exactly at the threshold is not yet eligible
        assert!(!state.needs_compaction(25));

        state.mark_removed(1);
        assert!(state.needs_compaction(25));
    }

    #[test]
    fn test_reindex_from_block_infos() {
        let mut a = BlockFileInfo::default();
        a.add_record(100, 0);
        a.add_record(200, 0);
        let mut b = BlockFileInfo::default();
        b.add_record(50, 0);

        let state = RepositoryAggregateState::reindex(&[a, b]);
        assert_eq!(state.total_bytes, 350);
        assert_eq!(state.records, 3);
        assert_eq!(state.block_files, 2);
        assert_eq!(state.removal_candidate_bytes, 0);
    }

    #[test]
    fn test_sync_state_lifecycle() {
        let state = SyncState::default();
        assert!(state.is_null());

        let mut state = SyncState::begin();
        assert!(!state.is_null());
        assert_eq!(state.last_source_block, -1);
        assert_eq!(state.last_temp_block, -1);

        state.clear();
        assert!(state.is_null());
    }
}
