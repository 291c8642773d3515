//! AES-256-CBC file encryption
//!
//! Wire format: `iv (16 bytes) || ciphertext`. The first plaintext block fed
//! to the cipher is random filler, so the true start of content never sits at
//! a predictable ciphertext position; this is a compatibility requirement of
//! the transfer protocol. The final block carries 1..=16 padding bytes whose
//! count is encoded in the very last byte — the filler bytes before it are
//! random, not zero. Plaintexts that are an exact block multiple gain a full
//! padding block.
//!
//! Both directions stream through a fixed-size working buffer, so payloads
//! never need to be resident twice.

use super::CryptoError;
use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Key length in bytes (AES-256).
pub const AES_KEY_LEN: usize = 32;

/// Cipher block length in bytes.
pub const AES_BLOCK_LEN: usize = 16;

/// Working buffer for streaming; always a whole number of blocks.
const WORK_BUF_LEN: usize = 2048;

/// A 256-bit symmetric file key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AesKey([u8; AES_KEY_LEN]);

impl AesKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; AES_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; AES_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; AES_KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for AesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print key material
        write!(f, "AesKey(..)")
    }
}

fn encrypt_blocks(enc: &mut Aes256CbcEnc, buf: &mut [u8]) {
    for block in buf.chunks_exact_mut(AES_BLOCK_LEN) {
        enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn decrypt_blocks(dec: &mut Aes256CbcDec, buf: &mut [u8]) {
    for block in buf.chunks_exact_mut(AES_BLOCK_LEN) {
        dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

/// Encrypt `size` plaintext bytes from `src` into `dst`.
///
/// Returns the number of ciphertext bytes written (IV included).
pub fn encrypt<R: Read, W: Write>(
    key: &AesKey,
    src: &mut R,
    dst: &mut W,
    size: u64,
) -> Result<u64, CryptoError> {
    let mut iv = [0u8; AES_BLOCK_LEN];
    OsRng.fill_bytes(&mut iv);
    dst.write_all(&iv)?;

    let mut enc = Aes256CbcEnc::new(
        GenericArray::from_slice(&key.0),
        GenericArray::from_slice(&iv),
    );
    let mut buf = [0u8; WORK_BUF_LEN + AES_BLOCK_LEN];
    let mut written = AES_BLOCK_LEN as u64;

    // leading random block
    OsRng.fill_bytes(&mut buf[..AES_BLOCK_LEN]);
    encrypt_blocks(&mut enc, &mut buf[..AES_BLOCK_LEN]);
    dst.write_all(&buf[..AES_BLOCK_LEN])?;
    written += AES_BLOCK_LEN as u64;

    let mut total_read = 0u64;
    loop {
        let want = (size - total_read).min(WORK_BUF_LEN as u64) as usize;
        src.read_exact(&mut buf[..want])?;
        total_read += want as u64;
        let mut len = want;

        if total_read == size {
            // random-filler padding, length in the last byte
            let pad = AES_BLOCK_LEN - (want % AES_BLOCK_LEN);
            OsRng.fill_bytes(&mut buf[want..want + pad - 1]);
            buf[want + pad - 1] = pad as u8;
            len += pad;
        }

        encrypt_blocks(&mut enc, &mut buf[..len]);
        dst.write_all(&buf[..len])?;
        written += len as u64;

        if total_read == size {
            break;
        }
    }

    Ok(written)
}

/// Decrypt `size` ciphertext bytes (IV included) from `src` into `dst`.
///
/// Returns the number of plaintext bytes written. Fails cleanly on truncated
/// input and on invalid padding; CBC carries no integrity tag, so callers
/// verify the decrypted content hash (the envelope records it).
pub fn decrypt<R: Read, W: Write>(
    key: &AesKey,
    src: &mut R,
    dst: &mut W,
    size: u64,
) -> Result<u64, CryptoError> {
    // minimum: iv + leading random block + one padded block
    if size < 3 * AES_BLOCK_LEN as u64 || (size - AES_BLOCK_LEN as u64) % AES_BLOCK_LEN as u64 != 0
    {
        return Err(CryptoError::TruncatedCiphertext { size });
    }

    let mut iv = [0u8; AES_BLOCK_LEN];
    src.read_exact(&mut iv)?;

    let mut dec = Aes256CbcDec::new(
        GenericArray::from_slice(&key.0),
        GenericArray::from_slice(&iv),
    );
    let mut buf = [0u8; WORK_BUF_LEN + AES_BLOCK_LEN];

    // decrypt and discard the leading random block
    src.read_exact(&mut buf[..AES_BLOCK_LEN])?;
    decrypt_blocks(&mut dec, &mut buf[..AES_BLOCK_LEN]);

    let mut remaining = size - 2 * AES_BLOCK_LEN as u64;
    let mut written = 0u64;
    while remaining > 0 {
        let len = remaining.min(WORK_BUF_LEN as u64) as usize;
        src.read_exact(&mut buf[..len])?;
        remaining -= len as u64;
        decrypt_blocks(&mut dec, &mut buf[..len]);

        let mut out = len;
        if remaining == 0 {
            let pad = buf[len - 1];
            if pad == 0 || pad as usize > AES_BLOCK_LEN || pad as usize > len {
                return Err(CryptoError::InvalidPadding(pad));
            }
            out = len - pad as usize;
        }

        dst.write_all(&buf[..out])?;
        written += out as u64;
    }

    Ok(written)
}
