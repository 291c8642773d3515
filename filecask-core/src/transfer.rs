//! File transfer protocol seam
//!
//! Maps the three ledger record kinds onto the envelope crypto and the
//! repository manager:
//!
//! ```text
//! PaymentRequest { price, description }
//!   → PaymentConfirm { request_txid, recipient_public_key }
//!     → FileTransfer { confirm_txid, sealed_envelope, encrypted_blob_hash }
//! ```
//!
//! Each stage references the previous one by transaction hash. The
//! repository is touched only at the `FileTransfer` stage, with the key
//! material established at `PaymentConfirm`. The ledger engine itself —
//! validation, ordering, chain time — stays external; this module only
//! consumes transaction hashes and byte payloads.

use crate::crypto::{CryptoError, aes, rsa};
use crate::error::Result;
use crate::hash::ContentHash;
use crate::manager::RepositoryManager;
use crate::record::StoredRecord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::sync::Mutex;
use tracing::debug;

/// Errors from the transfer protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("metadata stage mismatch: expected {expected}, got {got}")]
    StageMismatch {
        expected: &'static str,
        got: &'static str,
    },

    #[error("stage does not reference the previous transaction ({expected}, got {got})")]
    BrokenLink {
        expected: ContentHash,
        got: ContentHash,
    },

    /// Decrypted content does not match the envelope's original file hash.
    #[error("decrypted content hash mismatch: envelope says {expected}, got {got}")]
    ContentMismatch {
        expected: ContentHash,
        got: ContentHash,
    },

    #[error("decrypted size {got} disagrees with envelope size {expected}")]
    SizeMismatch { expected: u64, got: u64 },

    #[error(transparent)]
    Repository(#[from] crate::error::RepositoryError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// The small metadata blob a seller wraps under the buyer's public key:
/// everything needed to decrypt and verify the blob after transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Hash of the original (decrypted) file.
    pub original_file_hash: ContentHash,
    pub file_name: String,
    /// The symmetric key the file was encrypted with.
    pub symmetric_key: aes::AesKey,
    pub original_file_size: u64,
}

impl Envelope {
    /// Serialize and encrypt whole under the recipient's public key.
    pub fn seal(&self, recipient_public_der: &[u8]) -> std::result::Result<Vec<u8>, CryptoError> {
        let plain =
            bincode::serialize(self).map_err(|e| CryptoError::Envelope(e.to_string()))?;
        rsa::wrap(recipient_public_der, &plain)
    }

    /// Decrypt with the matching private key and deserialize.
    pub fn open(
        sealed: &[u8],
        keypair: &rsa::RsaKeypair,
    ) -> std::result::Result<Self, CryptoError> {
        let plain = rsa::unwrap(keypair, sealed)?;
        bincode::deserialize(&plain).map_err(|e| CryptoError::Envelope(e.to_string()))
    }
}

/// First stage: the seller names a price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub price: u64,
    pub description: String,
}

/// Second stage: the buyer pays and supplies a fresh public key for the
/// envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfirm {
    /// Hash of the payment-request transaction.
    pub request_txid: ContentHash,
    /// DER-encoded RSA public key of the receiver.
    pub recipient_public_key: Vec<u8>,
}

/// Third stage: the seller ships the sealed envelope and the blob hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransfer {
    /// Hash of the payment-confirm transaction.
    pub confirm_txid: ContentHash,
    /// The envelope, encrypted under the confirm's public key.
    pub sealed_envelope: Vec<u8>,
    /// Content hash of the encrypted blob held by the repository.
    pub encrypted_blob_hash: ContentHash,
}

/// Transaction metadata over the closed set of kinds, selected and matched
/// explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TxMetadata {
    Empty,
    PaymentRequest(PaymentRequest),
    PaymentConfirm(PaymentConfirm),
    FileTransfer(FileTransfer),
}

impl TxMetadata {
    pub fn kind(&self) -> &'static str {
        match self {
            TxMetadata::Empty => "empty",
            TxMetadata::PaymentRequest(_) => "payment-request",
            TxMetadata::PaymentConfirm(_) => "payment-confirm",
            TxMetadata::FileTransfer(_) => "file-transfer",
        }
    }

    /// Validate that this stage correctly references the previous one.
    ///
    /// `prev_txid` is the ledger hash of the transaction carrying `prev`.
    pub fn validate_link(
        &self,
        prev: &TxMetadata,
        prev_txid: &ContentHash,
    ) -> std::result::Result<(), TransferError> {
        match (self, prev) {
            (TxMetadata::PaymentConfirm(confirm), TxMetadata::PaymentRequest(_)) => {
                if confirm.request_txid != *prev_txid {
                    return Err(TransferError::BrokenLink {
                        expected: *prev_txid,
                        got: confirm.request_txid,
                    });
                }
                Ok(())
            }
            (TxMetadata::PaymentConfirm(_), other) => Err(TransferError::StageMismatch {
                expected: "payment-request",
                got: other.kind(),
            }),
            (TxMetadata::FileTransfer(transfer), TxMetadata::PaymentConfirm(_)) => {
                if transfer.confirm_txid != *prev_txid {
                    return Err(TransferError::BrokenLink {
                        expected: *prev_txid,
                        got: transfer.confirm_txid,
                    });
                }
                Ok(())
            }
            (TxMetadata::FileTransfer(_), other) => Err(TransferError::StageMismatch {
                expected: "payment-confirm",
                got: other.kind(),
            }),
            (this, _) => Err(TransferError::StageMismatch {
                expected: "payment-confirm or file-transfer",
                got: this.kind(),
            }),
        }
    }
}

/// Seller side: encrypt `plaintext` under a fresh file key, seal the
/// envelope under the confirm's public key, and produce both the
/// `FileTransfer` metadata and the repository record to save.
pub fn prepare_transfer(
    plaintext: &[u8],
    file_name: &str,
    confirm_txid: ContentHash,
    confirm: &PaymentConfirm,
    expires_at: i64,
) -> Result<(FileTransfer, StoredRecord)> {
    let key = aes::AesKey::generate();

    let mut ciphertext = Vec::new();
    aes::encrypt(
        &key,
        &mut Cursor::new(plaintext),
        &mut ciphertext,
        plaintext.len() as u64,
    )?;

    let envelope = Envelope {
        original_file_hash: ContentHash::from_data(plaintext),
        file_name: file_name.to_string(),
        symmetric_key: key,
        original_file_size: plaintext.len() as u64,
    };
    let sealed_envelope = envelope.seal(&confirm.recipient_public_key)?;

    // the seller's own upload: never auto-expired locally
    let record = StoredRecord::new(ciphertext, expires_at, true);
    debug!(blob = %record.hash, file_name, "transfer prepared");

    let transfer = FileTransfer {
        confirm_txid,
        sealed_envelope,
        encrypted_blob_hash: record.hash,
    };
    Ok((transfer, record))
}

/// Buyer side: fetch the blob from the repository, open the envelope with
/// the retained private key, decrypt and verify the content.
pub fn accept_transfer(
    transfer: &FileTransfer,
    keypair: &rsa::RsaKeypair,
    manager: &RepositoryManager,
) -> std::result::Result<(Envelope, Vec<u8>), TransferError> {
    let record = manager.read(&transfer.encrypted_blob_hash)?;
    let envelope = Envelope::open(&transfer.sealed_envelope, keypair)?;

    let mut plaintext = Vec::new();
    aes::decrypt(
        &envelope.symmetric_key,
        &mut Cursor::new(&record.payload),
        &mut plaintext,
        record.payload.len() as u64,
    )?;

    if plaintext.len() as u64 != envelope.original_file_size {
        return Err(TransferError::SizeMismatch {
            expected: envelope.original_file_size,
            got: plaintext.len() as u64,
        });
    }
    let got = ContentHash::from_data(&plaintext);
    if got != envelope.original_file_hash {
        return Err(TransferError::ContentMismatch {
            expected: envelope.original_file_hash,
            got,
        });
    }

    debug!(blob = %transfer.encrypted_blob_hash, "transfer accepted");
    Ok((envelope, plaintext))
}

/// A file announced on the ledger whose bytes have not arrived yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingFile {
    /// Ledger transaction that carries the transfer metadata.
    pub file_txid: ContentHash,
    /// Peers known to hold the bytes.
    pub nodes: BTreeSet<u64>,
}

/// An outstanding fetch from one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InFlightRequest {
    pub node_id: u64,
    pub requested_at: i64,
}

/// A file this node must obtain, with its request and payload deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequiredFile {
    pub request_expires_at: i64,
    pub file_expires_at: i64,
}

/// Node-side bookkeeping of files moving between peers. Guarded by its own
/// lock; maintenance code acquires this before the repository lock, never
/// the reverse.
#[derive(Default)]
pub struct PendingFileTracker {
    inner: Mutex<TrackerMaps>,
}

#[derive(Default)]
struct TrackerMaps {
    pending: BTreeMap<ContentHash, PendingFile>,
    in_flight: BTreeMap<ContentHash, InFlightRequest>,
    required: BTreeMap<ContentHash, RequiredFile>,
}

/// Read-only snapshot of the tracker plus lock-contention probes —
/// informational only, not part of the durability contract.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub pending: BTreeMap<String, PendingFile>,
    pub in_flight: BTreeMap<String, InFlightRequest>,
    pub required: BTreeMap<String, RequiredFile>,
    pub tracker_lock_contended: bool,
    pub repository_lock_contended: bool,
}

impl PendingFileTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerMaps> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Note a peer announcing it holds the bytes for a transfer.
    pub fn add_pending(&self, blob_hash: ContentHash, file_txid: ContentHash, node_id: u64) {
        let mut maps = self.lock();
        maps.pending
            .entry(blob_hash)
            .or_insert_with(|| PendingFile {
                file_txid,
                nodes: BTreeSet::new(),
            })
            .nodes
            .insert(node_id);
    }

    /// Record an outstanding fetch.
    pub fn mark_in_flight(&self, blob_hash: ContentHash, node_id: u64, now: i64) {
        self.lock().in_flight.insert(
            blob_hash,
            InFlightRequest {
                node_id,
                requested_at: now,
            },
        );
    }

    /// Record a file this node must obtain.
    pub fn add_required(
        &self,
        blob_hash: ContentHash,
        request_expires_at: i64,
        file_expires_at: i64,
    ) {
        self.lock().required.insert(
            blob_hash,
            RequiredFile {
                request_expires_at,
                file_expires_at,
            },
        );
    }

    /// Drop all bookkeeping for a blob once its bytes arrived.
    pub fn complete(&self, blob_hash: &ContentHash) {
        let mut maps = self.lock();
        maps.pending.remove(blob_hash);
        maps.in_flight.remove(blob_hash);
        maps.required.remove(blob_hash);
    }

    /// Snapshot the tracker for the diagnostics surface.
    pub fn diagnostics(&self, manager: &RepositoryManager) -> DiagnosticsReport {
        let tracker_lock_contended = self.inner.try_lock().is_err();
        let maps = self.lock();
        DiagnosticsReport {
            pending: maps
                .pending
                .iter()
                .map(|(k, v)| (k.to_hex(), v.clone()))
                .collect(),
            in_flight: maps
                .in_flight
                .iter()
                .map(|(k, v)| (k.to_hex(), v.clone()))
                .collect(),
            required: maps
                .required
                .iter()
                .map(|(k, v)| (k.to_hex(), v.clone()))
                .collect(),
            tracker_lock_contended,
            repository_lock_contended: manager.lock_contended(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepositoryConfig;
    use tempfile::TempDir;

    fn txid(n: u8) -> ContentHash {
        ContentHash::from_data(&[n])
    }

    fn handshake() -> (rsa::RsaKeypair, ContentHash, PaymentConfirm) {
        let keypair = rsa::RsaKeypair::generate().unwrap();
        let confirm = PaymentConfirm {
            request_txid: txid(1),
            recipient_public_key: keypair.public_der().unwrap(),
        };
        (keypair, txid(2), confirm)
    }

    #[test]
    fn test_envelope_seal_open_roundtrip() {
        let keypair = rsa::RsaKeypair::generate().unwrap();
        let envelope = Envelope {
            original_file_hash: ContentHash::from_data(b"file body"),
            file_name: "notes.txt".to_string(),
            symmetric_key: aes::AesKey::generate(),
            original_file_size: 9,
        };

        let sealed = envelope.seal(&keypair.public_der().unwrap()).unwrap();
        let opened = Envelope::open(&sealed, &keypair).unwrap();
        assert_eq!(opened.original_file_hash, envelope.original_file_hash);
        assert_eq!(opened.file_name, "notes.txt");
        assert_eq!(opened.symmetric_key, envelope.symmetric_key);
        assert_eq!(opened.original_file_size, 9);
    }

    #[test]
    fn test_envelope_secrecy() {
        let keypair = rsa::RsaKeypair::generate().unwrap();
        let unrelated = rsa::RsaKeypair::generate().unwrap();
        let envelope = Envelope {
            original_file_hash: ContentHash::from_data(b"x"),
            file_name: "x".to_string(),
            symmetric_key: aes::AesKey::generate(),
            original_file_size: 1,
        };

        let sealed = envelope.seal(&keypair.public_der().unwrap()).unwrap();
        assert!(Envelope::open(&sealed, &unrelated).is_err());
    }

    #[test]
    fn test_stage_linking() {
        let request = TxMetadata::PaymentRequest(PaymentRequest {
            price: 500,
            description: "dataset".to_string(),
        });
        let confirm = TxMetadata::PaymentConfirm(PaymentConfirm {
            request_txid: txid(1),
            recipient_public_key: vec![],
        });
        let transfer = TxMetadata::FileTransfer(FileTransfer {
            confirm_txid: txid(2),
            sealed_envelope: vec![],
            encrypted_blob_hash: txid(9),
        });

        confirm.validate_link(&request, &txid(1)).unwrap();
        transfer.validate_link(&confirm, &txid(2)).unwrap();

        // wrong back-reference
        assert!(matches!(
            confirm.validate_link(&request, &txid(7)),
            Err(TransferError::BrokenLink { .. })
        ));
        // wrong previous stage
        assert!(matches!(
            transfer.validate_link(&request, &txid(1)),
            Err(TransferError::StageMismatch { .. })
        ));
        // empty metadata can never start a link
        assert!(
            TxMetadata::Empty
                .validate_link(&request, &txid(1))
                .is_err()
        );
    }

    #[test]
    fn test_prepare_accept_end_to_end() {
        let tmp = TempDir::new().unwrap();
        let manager = RepositoryManager::open(RepositoryConfig::new(tmp.path())).unwrap();
        let (keypair, confirm_txid, confirm) = handshake();

        let plaintext: Vec<u8> = (0..5000u32).map(|i| (i % 241) as u8).collect();
        let (transfer, mut record) =
            prepare_transfer(&plaintext, "dataset.bin", confirm_txid, &confirm, i64::MAX)
                .unwrap();

        // ciphertext, not plaintext, is what the repository holds
        assert_ne!(record.payload, plaintext);
        manager.save(&mut record).unwrap();

        let (envelope, decrypted) = accept_transfer(&transfer, &keypair, &manager).unwrap();
        assert_eq!(decrypted, plaintext);
        assert_eq!(envelope.file_name, "dataset.bin");
        assert_eq!(envelope.original_file_size, 5000);
    }

    #[test]
    fn test_accept_with_wrong_keypair_fails() {
        let tmp = TempDir::new().unwrap();
        let manager = RepositoryManager::open(RepositoryConfig::new(tmp.path())).unwrap();
        let (_keypair, confirm_txid, confirm) = handshake();
        let wrong = rsa::RsaKeypair::generate().unwrap();

        let (transfer, mut record) =
            prepare_transfer(b"secret", "s.txt", confirm_txid, &confirm, i64::MAX).unwrap();
        manager.save(&mut record).unwrap();

        assert!(matches!(
            accept_transfer(&transfer, &wrong, &manager),
            Err(TransferError::Crypto(_))
        ));
    }

    #[test]
    fn test_tracker_lifecycle_and_diagnostics() {
        let tmp = TempDir::new().unwrap();
        let manager = RepositoryManager::open(RepositoryConfig::new(tmp.path())).unwrap();
        let tracker = PendingFileTracker::new();

        let blob = txid(5);
        tracker.add_pending(blob, txid(6), 11);
        tracker.add_pending(blob, txid(6), 12);
        tracker.mark_in_flight(blob, 11, 1000);
        tracker.add_required(blob, 2000, 3000);

        let report = tracker.diagnostics(&manager);
        assert_eq!(report.pending[&blob.to_hex()].nodes.len(), 2);
        assert_eq!(report.in_flight[&blob.to_hex()].node_id, 11);
        assert!(!report.tracker_lock_contended);
        assert!(!report.repository_lock_contended);

        tracker.complete(&blob);
        let report = tracker.diagnostics(&manager);
        assert!(report.pending.is_empty());
        assert!(report.in_flight.is_empty());
        assert!(report.required.is_empty());
    }
}
