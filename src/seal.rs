//! Producer-side sealing.
//!
//! Builds the artefacts a client resolves: fragment sets for bootstrap URLs,
//! the sealed manifest listing real endpoints, and the sealed payload. Keys
//! come from the same [`KeyDerivationService`] scheme the client uses, so the
//! sealer must be bound to the same identity (normally the fleet fingerprint).

use std::sync::Arc;
use std::time::Duration;

use zeroize::Zeroizing;

use crate::crypto::{
    AeadCodec, CryptoError, DeviceFingerprint, Envelope, FingerprintSource, KeyDerivationError,
    KeyDerivationService, KeyPurpose, StaticFingerprint,
};
use crate::crypto::fingerprint::FingerprintError;
use crate::fragment::{is_plausible_url, FragmentAssembler, FragmentError, FragmentSet};
use crate::platform::{Clock, SystemClock};

const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error(transparent)]
    Key(#[from] KeyDerivationError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Fragment(#[from] FragmentError),
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),
    #[error("Not an https endpoint: {0}")]
    InvalidEndpoint(String),
}

pub struct Sealer {
    kds: Arc<KeyDerivationService>,
    codec: AeadCodec,
    assembler: FragmentAssembler,
}

impl Sealer {
    pub fn new(kds: Arc<KeyDerivationService>, clock: Arc<dyn Clock>) -> Self {
        Self { kds, codec: AeadCodec::new(clock), assembler: FragmentAssembler::new() }
    }

    /// Sealer bound to a fleet identity given as hex.
    pub fn for_fleet(fleet_hex: &str, rounds: u32) -> Result<Self, SealError> {
        let source = StaticFingerprint::from_hex(fleet_hex)?;
        // Fail here rather than on the first derive.
        DeviceFingerprint::compute(&source)?;
        let kds = Arc::new(KeyDerivationService::new(&source, rounds));
        Ok(Self::new(kds, Arc::new(SystemClock)))
    }

    /// Manifest envelope listing `endpoints`, one per line.
    pub fn seal_manifest(&self, endpoints: &[String], ttl: Duration) -> Result<Envelope, SealError> {
        if let Some(bad) = endpoints
            .iter()
            .find(|e| !e.starts_with("https://") || !is_plausible_url(e))
        {
            return Err(SealError::InvalidEndpoint(bad.clone()));
        }
        self.seal(KeyPurpose::Content, endpoints.join("\n").as_bytes(), ttl)
    }

    pub fn seal_payload(&self, payload: &[u8], ttl: Duration) -> Result<Envelope, SealError> {
        self.seal(KeyPurpose::Main, payload, ttl)
    }

    pub fn seal(&self, purpose: KeyPurpose, plaintext: &[u8], ttl: Duration) -> Result<Envelope, SealError> {
        let key = self.kds.derive(purpose, KEY_LEN)?;
        let sealed = self.codec.seal_envelope(plaintext, key.as_bytes(), ttl);
        key.burn();
        Ok(sealed?)
    }

    /// Verifies and decrypts an envelope the way a client would.
    pub fn open(&self, purpose: KeyPurpose, envelope: &Envelope) -> Result<Zeroizing<Vec<u8>>, SealError> {
        let key = self.kds.derive(purpose, KEY_LEN)?;
        let opened = self.codec.open_envelope(envelope, key.as_bytes());
        key.burn();
        Ok(opened?)
    }

    /// Fragment set for a bootstrap URL, with a random permutation.
    pub fn fragment(&self, url: &str, pieces: usize) -> Result<FragmentSet, SealError> {
        let key = self.kds.derive(KeyPurpose::Bootstrap, KEY_LEN)?;
        let set = self.assembler.split_shuffled(url, pieces, key.as_bytes());
        key.burn();
        Ok(set?)
    }
}

/// Hex identity material of `source`, usable as `fleet_fingerprint_hex`.
pub fn identity_hex(source: &dyn FingerprintSource) -> Result<String, FingerprintError> {
    let material = source.identity_material()?;
    Ok(hex::encode(material.as_slice()))
}
