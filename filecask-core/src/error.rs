//! Error types for repository operations

use crate::crypto::CryptoError;
use crate::hash::ContentHash;

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Errors that can occur during repository operations
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// A single record must never span two block files.
    #[error("record of {size} bytes exceeds the block file cap of {max} bytes")]
    RecordTooLarge { size: u32, max: u32 },

    #[error("out of disk space: {needed} more bytes required")]
    OutOfDiskSpace { needed: u64 },

    #[error("file not found: {0}")]
    NotFound(ContentHash),

    /// Framing or hash mismatch — index/data desynchronization, never
    /// silently repaired.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index error: {0}")]
    Index(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl From<sled::Error> for RepositoryError {
    fn from(e: sled::Error) -> Self {
        RepositoryError::Index(e.to_string())
    }
}

impl From<bincode::Error> for RepositoryError {
    fn from(e: bincode::Error) -> Self {
        RepositoryError::Serialization(e.to_string())
    }
}
