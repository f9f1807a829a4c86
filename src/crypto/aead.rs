//! Authenticated envelopes.
//!
//! # Wire format
//! - Blob: `iv (12) || ciphertext || tag (16)`, AES-GCM, base64 on the wire.
//! - Envelope: `{"data": b64(blob), "iv": b64(iv), "meta": b64(metaJson "|" hmacHex)}`
//! - metaJson: `{"timestamp": <ms>, "expiry": <ms>}`, authenticated with
//!   HMAC-SHA256 under the same key.
//!
//! # Opening order
//! metadata checksum -> expiry -> iv binding -> AEAD. Anything that fails
//! before the AEAD step never touches the ciphertext.

use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{constant_time_eq, hmac_sha256, CryptoError};
use crate::platform::Clock;

pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

const META_SEPARATOR: char = '|';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

impl EncryptedBlob {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IV_LEN + self.ciphertext.len() + TAG_LEN);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() < IV_LEN + TAG_LEN {
            return Err(CryptoError::Malformed("blob shorter than iv + tag"));
        }
        let (iv, rest) = bytes.split_at(IV_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
        let mut blob = Self {
            iv: [0u8; IV_LEN],
            ciphertext: ciphertext.to_vec(),
            tag: [0u8; TAG_LEN],
        };
        blob.iv.copy_from_slice(iv);
        blob.tag.copy_from_slice(tag);
        Ok(blob)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    pub fn from_base64(text: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64
            .decode(text.trim())
            .map_err(|_| CryptoError::Malformed("blob is not base64"))?;
        Self::from_bytes(&bytes)
    }
}

#[derive(Serialize, Deserialize)]
struct MetaFields {
    timestamp: u64,
    expiry: u64,
}

/// Out-of-band metadata. `timestamp` and `expiry` are untrusted until
/// [`AeadCodec::verify_metadata`] accepts the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub timestamp: u64,
    pub expiry: u64,
    pub checksum: String,
    json: String,
}

impl Metadata {
    /// Creates metadata and its checksum under `key`.
    pub fn sign(timestamp: u64, expiry: u64, key: &[u8]) -> Self {
        // Serializing two integers cannot fail.
        let json = serde_json::to_string(&MetaFields { timestamp, expiry }).unwrap_or_default();
        let checksum = hex::encode(hmac_sha256(key, json.as_bytes()));
        Self { timestamp, expiry, checksum, json }
    }

    /// The exact JSON text the checksum covers.
    pub fn json(&self) -> &str {
        &self.json
    }

    pub fn encode(&self) -> String {
        BASE64.encode(format!("{}{}{}", self.json, META_SEPARATOR, self.checksum))
    }

    pub fn decode(text: &str) -> Result<Self, CryptoError> {
        let raw = BASE64
            .decode(text.trim())
            .map_err(|_| CryptoError::Malformed("meta is not base64"))?;
        let raw = String::from_utf8(raw).map_err(|_| CryptoError::Malformed("meta is not utf-8"))?;
        let (json, checksum) = raw
            .rsplit_once(META_SEPARATOR)
            .ok_or(CryptoError::Malformed("meta has no checksum"))?;
        let fields: MetaFields =
            serde_json::from_str(json).map_err(|_| CryptoError::Malformed("meta json"))?;
        Ok(Self {
            timestamp: fields.timestamp,
            expiry: fields.expiry,
            checksum: checksum.to_string(),
            json: json.to_string(),
        })
    }
}

/// JSON sidecar carried over the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub data: String,
    pub iv: String,
    pub meta: String,
}

impl Envelope {
    pub fn from_json(text: &str) -> Result<Self, CryptoError> {
        serde_json::from_str(text.trim()).map_err(|_| CryptoError::Malformed("envelope json"))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

enum GcmCipher {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
}

impl GcmCipher {
    fn new(key: &[u8]) -> Result<Self, CryptoError> {
        match key.len() {
            16 => Aes128Gcm::new_from_slice(key)
                .map(GcmCipher::Aes128)
                .map_err(|_| CryptoError::InvalidKey),
            32 => Aes256Gcm::new_from_slice(key)
                .map(GcmCipher::Aes256)
                .map_err(|_| CryptoError::InvalidKey),
            _ => Err(CryptoError::InvalidKey),
        }
    }

    fn encrypt(&self, iv: &[u8; IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Nonce::from_slice(iv);
        match self {
            GcmCipher::Aes128(c) => c.encrypt(nonce, plaintext),
            GcmCipher::Aes256(c) => c.encrypt(nonce, plaintext),
        }
        .map_err(|_| CryptoError::Authentication)
    }

    fn decrypt(&self, iv: &[u8; IV_LEN], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Nonce::from_slice(iv);
        match self {
            GcmCipher::Aes128(c) => c.decrypt(nonce, sealed),
            GcmCipher::Aes256(c) => c.decrypt(nonce, sealed),
        }
        .map_err(|_| CryptoError::Authentication)
    }
}

pub struct AeadCodec {
    clock: Arc<dyn Clock>,
}

impl AeadCodec {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn encrypt(&self, plaintext: &[u8], key: &[u8]) -> Result<EncryptedBlob, CryptoError> {
        let cipher = GcmCipher::new(key)?;
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let mut sealed = cipher.encrypt(&iv, plaintext)?;
        let tag_start = sealed.len() - TAG_LEN;
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&sealed[tag_start..]);
        sealed.truncate(tag_start);

        Ok(EncryptedBlob { iv, ciphertext: sealed, tag })
    }

    /// Single authenticated decryption; there is no partial output.
    pub fn decrypt(&self, blob: &EncryptedBlob, key: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let cipher = GcmCipher::new(key)?;
        let mut sealed = Vec::with_capacity(blob.ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(&blob.ciphertext);
        sealed.extend_from_slice(&blob.tag);
        cipher.decrypt(&blob.iv, &sealed).map(Zeroizing::new)
    }

    pub fn issue_metadata(&self, ttl: Duration, key: &[u8]) -> Metadata {
        let now = self.clock.now_millis();
        Metadata::sign(now, now.saturating_add(ttl.as_millis() as u64), key)
    }

    pub fn verify_metadata(&self, metadata: &Metadata, key: &[u8]) -> bool {
        let Ok(claimed) = hex::decode(&metadata.checksum) else {
            return false;
        };
        let expected = hmac_sha256(key, metadata.json.as_bytes());
        constant_time_eq(&claimed, &expected)
    }

    pub fn is_expired(&self, metadata: &Metadata) -> bool {
        self.clock.now_millis() > metadata.expiry
    }

    pub fn seal_envelope(&self, plaintext: &[u8], key: &[u8], ttl: Duration) -> Result<Envelope, CryptoError> {
        let blob = self.encrypt(plaintext, key)?;
        let metadata = self.issue_metadata(ttl, key);
        Ok(Envelope {
            data: blob.to_base64(),
            iv: BASE64.encode(blob.iv),
            meta: metadata.encode(),
        })
    }

    pub fn open_envelope(&self, envelope: &Envelope, key: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let blob = EncryptedBlob::from_base64(&envelope.data)?;
        let sidecar_iv = BASE64
            .decode(envelope.iv.trim())
            .map_err(|_| CryptoError::Malformed("iv is not base64"))?;
        let metadata = Metadata::decode(&envelope.meta)?;

        if !self.verify_metadata(&metadata, key) {
            return Err(CryptoError::Authentication);
        }
        if self.is_expired(&metadata) {
            return Err(CryptoError::Expired);
        }
        if !constant_time_eq(&sidecar_iv, &blob.iv) {
            return Err(CryptoError::Authentication);
        }
        self.decrypt(&blob, key)
    }
}
