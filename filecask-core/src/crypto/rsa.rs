//! RSA key-wrap for the metadata envelope
//!
//! A fresh 2048-bit keypair is generated by the buyer for each transaction
//! handshake; the public half travels in the payment-confirm record, DER
//! encoded (PKCS#1). The seller wraps the serialized envelope whole under
//! that public key. PKCS#1 v1.5 caps the plaintext at `key size - 11` bytes,
//! which is why only the envelope is ever wrapped, never file contents.

use super::CryptoError;
use rand::rngs::OsRng;
use rsa::pkcs1::{
    DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey,
};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

/// Key size for transaction-handshake keypairs.
pub const RSA_KEY_BITS: usize = 2048;

/// PKCS#1 v1.5 padding overhead in bytes.
const PKCS1_OVERHEAD: usize = 11;

/// A recipient-owned keypair; the private half never leaves the node that
/// generated it.
pub struct RsaKeypair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl RsaKeypair {
    /// Generate a fresh keypair for one transaction handshake.
    pub fn generate() -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// DER-encoded (PKCS#1) public half, as embedded in payment-confirm
    /// records.
    pub fn public_der(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(self
            .public
            .to_pkcs1_der()
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?
            .as_bytes()
            .to_vec())
    }

    /// DER-encoded (PKCS#1) private half, for local retention only.
    pub fn private_der(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(self
            .private
            .to_pkcs1_der()
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?
            .as_bytes()
            .to_vec())
    }

    /// Rebuild a keypair from its DER-encoded private half.
    pub fn from_private_der(der: &[u8]) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::from_pkcs1_der(der)
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }
}

/// Encrypt `plaintext` under a DER-encoded public key.
pub fn wrap(public_der: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let key = RsaPublicKey::from_pkcs1_der(public_der)
        .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
    let limit = key.size() - PKCS1_OVERHEAD;
    if plaintext.len() > limit {
        return Err(CryptoError::EnvelopeTooLarge {
            len: plaintext.len(),
            limit,
        });
    }
    key.encrypt(&mut OsRng, Pkcs1v15Encrypt, plaintext)
        .map_err(|e| CryptoError::Wrap(e.to_string()))
}

/// Decrypt with the matching private key.
pub fn unwrap(keypair: &RsaKeypair, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    keypair
        .private
        .decrypt(Pkcs1v15Encrypt, ciphertext)
        .map_err(|e| CryptoError::Unwrap(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let keypair = RsaKeypair::generate().unwrap();
        let public = keypair.public_der().unwrap();

        let wrapped = wrap(&public, b"small secret").unwrap();
        assert_ne!(wrapped, b"small secret");
        let unwrapped = unwrap(&keypair, &wrapped).unwrap();
        assert_eq!(unwrapped, b"small secret");
    }

    #[test]
    fn test_unrelated_keypair_cannot_unwrap() {
        let keypair = RsaKeypair::generate().unwrap();
        let other = RsaKeypair::generate().unwrap();

        let wrapped = wrap(&keypair.public_der().unwrap(), b"secret").unwrap();
        assert!(unwrap(&other, &wrapped).is_err());
    }

    #[test]
    fn test_plaintext_limit_enforced() {
        let keypair = RsaKeypair::generate().unwrap();
        let public = keypair.public_der().unwrap();

        let at_limit = vec![1u8; 2048 / 8 - 11];
        assert!(wrap(&public, &at_limit).is_ok());

        let over = vec![1u8; 2048 / 8 - 10];
        let err = wrap(&public, &over).unwrap_err();
        assert!(matches!(err, CryptoError::EnvelopeTooLarge { .. }));
    }

    #[test]
    fn test_private_der_roundtrip() {
        let keypair = RsaKeypair::generate().unwrap();
        let der = keypair.private_der().unwrap();
        let restored = RsaKeypair::from_private_der(&der).unwrap();

        let wrapped = wrap(&keypair.public_der().unwrap(), b"hello").unwrap();
        assert_eq!(unwrap(&restored, &wrapped).unwrap(), b"hello");
    }
}
