//! On-disk record framing
//!
//! Every stored record is framed as:
//!
//! ```text
//! magic   [4]    protocol marker
//! nsize   u32    body length (header fields + payload)
//! flags   u32    bit 0 = removed, bit 1 = owned locally
//! expires i64    expiration timestamp (unix seconds)
//! hash    [32]   content hash of the payload
//! plen    u32    payload length
//! payload [plen] encrypted blob bytes
//! ```
//!
//! Reading verifies the magic before anything else; a mismatch indicates
//! index/data desynchronization and is surfaced as a hard corruption error.

use crate::error::{RepositoryError, Result};
use crate::hash::ContentHash;
use std::io::{Read, Seek, SeekFrom, Write};

/// Magic bytes prefixed to every framed record.
pub const RECORD_MAGIC: &[u8; 4] = b"FCSK";

/// Length of the fixed header fields inside the body: flags + expires +
/// hash + plen.
const HEADER_LEN: u32 = 4 + 8 + 32 + 4;

/// Magic + body length prefix.
const FRAME_OVERHEAD: u32 = 4 + 4;

/// Byte offset of the flags word from the record start, for in-place
/// soft-delete rewrites.
const FLAGS_OFFSET: u64 = FRAME_OVERHEAD as u64;

/// Record has been soft-deleted; bytes remain until compaction.
pub const FLAG_REMOVED: u32 = 1 << 0;

/// Record is the node's own upload and is never auto-expired.
pub const FLAG_OWNED: u32 = 1 << 1;

/// Total on-disk length of a record framing `payload_len` payload bytes.
pub fn framed_len(payload_len: u32) -> u32 {
    FRAME_OVERHEAD + HEADER_LEN + payload_len
}

/// A fully materialized stored record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub flags: u32,
    pub expires_at: i64,
    pub hash: ContentHash,
    pub payload: Vec<u8>,
}

impl StoredRecord {
    /// Build a record around an encrypted payload, computing its hash.
    pub fn new(payload: Vec<u8>, expires_at: i64, owned: bool) -> Self {
        let hash = ContentHash::from_data(&payload);
        let flags = if owned { FLAG_OWNED } else { 0 };
        Self {
            flags,
            expires_at,
            hash,
            payload,
        }
    }

    pub fn removed(&self) -> bool {
        self.flags & FLAG_REMOVED != 0
    }

    pub fn owned(&self) -> bool {
        self.flags & FLAG_OWNED != 0
    }

    /// Recompute the content hash from the payload bytes.
    pub fn update_hash(&mut self) -> ContentHash {
        self.hash = ContentHash::from_data(&self.payload);
        self.hash
    }

    /// Total on-disk length of this record.
    pub fn framed_len(&self) -> u32 {
        framed_len(self.payload.len() as u32)
    }

    /// Write the framed record. The hash is recomputed before serialization
    /// so an in-memory copy tampered with after construction cannot reach
    /// disk with a stale digest.
    pub fn write_to<W: Write>(&mut self, w: &mut W) -> Result<u32> {
        self.update_hash();
        let plen = self.payload.len() as u32;
        w.write_all(RECORD_MAGIC)?;
        w.write_all(&(HEADER_LEN + plen).to_le_bytes())?;
        w.write_all(&self.flags.to_le_bytes())?;
        w.write_all(&self.expires_at.to_le_bytes())?;
        w.write_all(self.hash.as_bytes())?;
        w.write_all(&plen.to_le_bytes())?;
        w.write_all(&self.payload)?;
        Ok(self.framed_len())
    }

    /// Read a framed record from the reader's current position.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let header = RecordHeader::read_from(r)?;
        let mut payload = vec![0u8; header.payload_len as usize];
        r.read_exact(&mut payload)?;
        Ok(Self {
            flags: header.flags,
            expires_at: header.expires_at,
            hash: header.hash,
            payload,
        })
    }
}

/// Header-only view of a record, used by the expiration scanner to avoid
/// pulling payloads into memory.
#[derive(Debug, Clone)]
pub struct RecordHeader {
    pub flags: u32,
    pub expires_at: i64,
    pub hash: ContentHash,
    pub payload_len: u32,
}

impl RecordHeader {
    pub fn removed(&self) -> bool {
        self.flags & FLAG_REMOVED != 0
    }

    pub fn owned(&self) -> bool {
        self.flags & FLAG_OWNED != 0
    }

    /// Read and validate the frame prefix and header fields.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != RECORD_MAGIC {
            return Err(RepositoryError::Corrupt(format!(
                "bad record magic {:02x?}",
                magic
            )));
        }

        let mut buf4 = [0u8; 4];
        let mut buf8 = [0u8; 8];
        let mut hash_bytes = [0u8; 32];

        r.read_exact(&mut buf4)?;
        let nsize = u32::from_le_bytes(buf4);
        r.read_exact(&mut buf4)?;
        let flags = u32::from_le_bytes(buf4);
        r.read_exact(&mut buf8)?;
        let expires_at = i64::from_le_bytes(buf8);
        r.read_exact(&mut hash_bytes)?;
        r.read_exact(&mut buf4)?;
        let payload_len = u32::from_le_bytes(buf4);

        if nsize != HEADER_LEN + payload_len {
            return Err(RepositoryError::Corrupt(format!(
                "record length prefix {} disagrees with payload length {}",
                nsize, payload_len
            )));
        }

        Ok(Self {
            flags,
            expires_at,
            hash: ContentHash::new(hash_bytes),
            payload_len,
        })
    }
}

/// Rewrite the flags word of the record starting at `record_start` in `f`,
/// leaving every other byte of the record untouched.
pub fn rewrite_flags<F: Write + Seek>(f: &mut F, record_start: u64, flags: u32) -> Result<()> {
    f.seek(SeekFrom::Start(record_start + FLAGS_OFFSET))?;
    f.write_all(&flags.to_le_bytes())?;
    Ok(())
}
