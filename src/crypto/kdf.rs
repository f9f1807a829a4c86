//! Purpose-bound key derivation.
//!
//! # Scheme
//! 1. **Password**: SHA-256(fingerprint) || shard A || shard B || purpose label
//! 2. **Salt**: salt shard XOR purpose label (label cycled over the shard)
//! 3. **KDF**: PBKDF2-HMAC-SHA256(password, salt, rounds >= 10 000)
//!
//! Every intermediate lives in a `Zeroizing` buffer, so it is wiped on every
//! exit path, early returns included.

use std::fmt;

use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use super::fingerprint::{DeviceFingerprint, FingerprintSource};
use super::sha256;
use super::shards::KeyShards;

/// Floor for PBKDF2 iterations.
pub const MIN_KDF_ROUNDS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyPurpose {
    /// Bootstrap URL fragments.
    Bootstrap,
    /// Bootstrap manifest envelopes.
    Content,
    /// Main configuration envelopes.
    Main,
    /// Encryption at rest for the persistent store.
    Storage,
    /// Request signature headers.
    Signing,
}

impl KeyPurpose {
    pub fn label(&self) -> &'static str {
        match self {
            KeyPurpose::Bootstrap => "BOOTSTRAP",
            KeyPurpose::Content => "CONTENT",
            KeyPurpose::Main => "MAIN",
            KeyPurpose::Storage => "STORAGE",
            KeyPurpose::Signing => "SIGNING",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyDerivationError {
    #[error("Unsupported key length {0}; expected 16 or 32")]
    UnsupportedLength(usize),
    #[error("Key factor unavailable: {0}")]
    MissingFactor(&'static str),
}

/// Key material for a single operation.
///
/// Not `Clone`. Call [`DerivedKey::burn`] when done; dropping also wipes it.
pub struct DerivedKey {
    purpose: KeyPurpose,
    bytes: Zeroizing<Vec<u8>>,
}

impl DerivedKey {
    pub fn purpose(&self) -> KeyPurpose {
        self.purpose
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Explicitly zeroes and releases the key.
    pub fn burn(mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("purpose", &self.purpose)
            .field("len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}

pub struct KeyDerivationService {
    fingerprint: Option<DeviceFingerprint>,
    shards: KeyShards,
    rounds: u32,
}

impl KeyDerivationService {
    /// Builds the service from a fingerprint source and the embedded shards.
    ///
    /// A source that cannot produce a fingerprint does not fail here; every
    /// later `derive` reports the missing factor instead.
    pub fn new(source: &dyn FingerprintSource, rounds: u32) -> Self {
        let fingerprint = match DeviceFingerprint::compute(source) {
            Ok(fp) => Some(fp),
            Err(e) => {
                log::warn!("Device fingerprint unavailable: {}", e);
                None
            }
        };
        Self {
            fingerprint,
            shards: KeyShards::embedded(),
            rounds: rounds.max(MIN_KDF_ROUNDS),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_shards(fingerprint: Option<DeviceFingerprint>, shards: KeyShards) -> Self {
        Self { fingerprint, shards, rounds: MIN_KDF_ROUNDS }
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn fingerprint(&self) -> Option<&DeviceFingerprint> {
        self.fingerprint.as_ref()
    }

    pub fn derive(&self, purpose: KeyPurpose, length: usize) -> Result<DerivedKey, KeyDerivationError> {
        if length != 16 && length != 32 {
            return Err(KeyDerivationError::UnsupportedLength(length));
        }
        let fingerprint = self
            .fingerprint
            .as_ref()
            .ok_or(KeyDerivationError::MissingFactor("fingerprint"))?;
        if let Some(missing) = self.shards.missing_factor() {
            return Err(KeyDerivationError::MissingFactor(missing));
        }

        let purpose_bytes = Zeroizing::new(purpose.label().as_bytes().to_vec());
        let fp_hash = Zeroizing::new(sha256(fingerprint.as_bytes()));

        let mut password = Zeroizing::new(Vec::with_capacity(
            fp_hash.len() + self.shards.a.len() + self.shards.b.len() + purpose_bytes.len(),
        ));
        password.extend_from_slice(fp_hash.as_slice());
        password.extend_from_slice(&self.shards.a);
        password.extend_from_slice(&self.shards.b);
        password.extend_from_slice(&purpose_bytes);

        let salt: Zeroizing<Vec<u8>> = Zeroizing::new(
            self.shards
                .salt
                .iter()
                .zip(purpose_bytes.iter().cycle())
                .map(|(s, p)| s ^ p)
                .collect(),
        );

        let mut out = Zeroizing::new(vec![0u8; length]);
        pbkdf2::pbkdf2_hmac::<Sha256>(&password, &salt, self.rounds, &mut out);

        Ok(DerivedKey { purpose, bytes: out })
    }
}
