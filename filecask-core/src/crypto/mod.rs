//! Envelope cryptography
//!
//! Symmetric AES-256-CBC file encryption and asymmetric RSA key-wrap of the
//! small metadata envelope. Cryptographic failures are a distinct error
//! category: a padding or unwrap failure must never be conflated with
//! "file not found".

pub mod aes;
pub mod rsa;

/// Errors from the envelope crypto layer.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("I/O error during cipher streaming: {0}")]
    Io(#[from] std::io::Error),

    /// Ciphertext shorter than the IV + leading block + one padded block,
    /// or not a whole number of cipher blocks.
    #[error("ciphertext truncated or misaligned ({size} bytes)")]
    TruncatedCiphertext { size: u64 },

    /// The trailing padding-length byte must be 1..=16.
    #[error("invalid padding length {0}")]
    InvalidPadding(u8),

    #[error("key encoding error: {0}")]
    KeyEncoding(String),

    /// The serialized envelope exceeds the RSA key's plaintext limit; only
    /// metadata is ever wrapped, never file contents.
    #[error("envelope of {len} bytes exceeds the {limit}-byte plaintext limit")]
    EnvelopeTooLarge { len: usize, limit: usize },

    #[error("asymmetric encryption failed: {0}")]
    Wrap(String),

    /// Decryption under the private key failed — wrong keypair or mangled
    /// ciphertext.
    #[error("asymmetric decryption failed: {0}")]
    Unwrap(String),

    #[error("envelope encoding error: {0}")]
    Envelope(String),
}
