//! Device fingerprint.
//!
//! A SHA-256 digest over host identifiers and a hashed salt. The digest is
//! computed once and never written anywhere; callers that need it again
//! recompute it from the same source.

use std::fmt;
use std::sync::Arc;

use zeroize::Zeroizing;

use super::sha256;
use crate::platform::EnvironmentProbe;

const FINGERPRINT_SALT: &[u8] = b"vc:Hb7#9pL2q5*K!";
const FIELD_SEPARATOR: u8 = 0x1f;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FingerprintError {
    #[error("No device identifiers available")]
    Unavailable,
}

/// Something that can produce the raw identity material for a fingerprint.
pub trait FingerprintSource: Send + Sync {
    fn identity_material(&self) -> Result<Zeroizing<Vec<u8>>, FingerprintError>;
}

/// Identity read from the host through an [`EnvironmentProbe`].
pub struct HostFingerprint {
    probe: Arc<dyn EnvironmentProbe>,
}

impl HostFingerprint {
    pub fn new(probe: Arc<dyn EnvironmentProbe>) -> Self {
        Self { probe }
    }
}

impl FingerprintSource for HostFingerprint {
    fn identity_material(&self) -> Result<Zeroizing<Vec<u8>>, FingerprintError> {
        let ids = self.probe.host_identifiers();
        if ids.iter().all(|id| id.is_empty()) {
            return Err(FingerprintError::Unavailable);
        }
        let mut material = Zeroizing::new(Vec::new());
        for id in ids.iter().filter(|id| !id.is_empty()) {
            material.extend_from_slice(id.as_bytes());
            material.push(FIELD_SEPARATOR);
        }
        Ok(material)
    }
}

/// Fixed identity, used for fleet-wide binding and by the sealing tool.
pub struct StaticFingerprint {
    material: Zeroizing<Vec<u8>>,
}

impl StaticFingerprint {
    pub fn new(material: impl Into<Vec<u8>>) -> Self {
        Self { material: Zeroizing::new(material.into()) }
    }

    pub fn from_hex(hex_id: &str) -> Result<Self, FingerprintError> {
        let bytes = hex::decode(hex_id.trim()).map_err(|_| FingerprintError::Unavailable)?;
        Ok(Self::new(bytes))
    }
}

impl FingerprintSource for StaticFingerprint {
    fn identity_material(&self) -> Result<Zeroizing<Vec<u8>>, FingerprintError> {
        if self.material.is_empty() {
            return Err(FingerprintError::Unavailable);
        }
        Ok(Zeroizing::new(self.material.to_vec()))
    }
}

/// Immutable fingerprint digest.
#[derive(Clone)]
pub struct DeviceFingerprint {
    digest: Zeroizing<[u8; 32]>,
}

impl DeviceFingerprint {
    pub fn compute(source: &dyn FingerprintSource) -> Result<Self, FingerprintError> {
        let material = source.identity_material()?;
        let mut input = Zeroizing::new(Vec::with_capacity(material.len() + 32));
        input.extend_from_slice(&material);
        input.extend_from_slice(&sha256(FINGERPRINT_SALT));
        Ok(Self { digest: Zeroizing::new(sha256(&input)) })
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.digest
    }

    /// Short non-secret label suitable for file names and logs.
    pub fn group_label(&self) -> String {
        hex::encode(&sha256(self.digest.as_slice())[..6])
    }
}

impl fmt::Debug for DeviceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceFingerprint({})", self.group_label())
    }
}
