//! Cryptographic core.
//!
//! - `fingerprint`: device identity digest, one of the key derivation factors.
//! - `kdf`: purpose-bound key derivation (PBKDF2-HMAC-SHA256).
//! - `aead`: AES-GCM blobs, authenticated metadata and the JSON envelope.
//!
//! No key material leaves this module in a non-zeroizing container.

pub mod aead;
pub mod fingerprint;
pub mod kdf;
mod shards;

pub use aead::{AeadCodec, EncryptedBlob, Envelope, Metadata};
pub use fingerprint::{DeviceFingerprint, FingerprintSource, HostFingerprint, StaticFingerprint};
pub use kdf::{DerivedKey, KeyDerivationError, KeyDerivationService, KeyPurpose};

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Errors from envelope handling and authenticated decryption.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// Ciphertext, tag, iv binding or metadata checksum did not verify.
    #[error("Authentication failed")]
    Authentication,
    /// Metadata verified but its expiry is in the past.
    #[error("Payload expired")]
    Expired,
    #[error("Malformed input: {0}")]
    Malformed(&'static str),
    #[error("Key length not supported")]
    InvalidKey,
}

pub(crate) fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    // HMAC accepts keys of any length.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC takes any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

#[inline(never)]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn test_hmac_known_vector() {
        // RFC 4231 test case 2.
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }
}
