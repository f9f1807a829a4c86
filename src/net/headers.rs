//! Request header shaping and signing.
//!
//! Every request (real or decoy) carries the same header shape: a browser
//! User-Agent plus `X-Timestamp`, `X-Noise` and `X-Signature`, where the
//! signature is HMAC-SHA256 over `host|timestamp|noise` under the signing key.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand_core::{OsRng, RngCore};

use super::host_of;
use crate::crypto::{constant_time_eq, hmac_sha256, KeyDerivationService, KeyPurpose};
use crate::platform::Clock;

pub const HEADER_TIMESTAMP: &str = "X-Timestamp";
pub const HEADER_NOISE: &str = "X-Noise";
pub const HEADER_SIGNATURE: &str = "X-Signature";
pub const HEADER_USER_AGENT: &str = "User-Agent";

const USER_AGENTS: [&str; 5] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Mobile/15E148 Safari/604.1",
];

pub struct RequestSigner {
    kds: Arc<KeyDerivationService>,
    clock: Arc<dyn Clock>,
}

impl RequestSigner {
    pub fn new(kds: Arc<KeyDerivationService>, clock: Arc<dyn Clock>) -> Self {
        Self { kds, clock }
    }

    pub fn user_agent() -> &'static str {
        USER_AGENTS.choose(&mut rand::thread_rng()).copied().unwrap_or(USER_AGENTS[0])
    }

    /// Headers for a request to `url`. Derivation failures abort the request.
    pub fn headers_for(&self, url: &str) -> Result<Vec<(String, String)>, super::NetError> {
        let host = host_of(url).ok_or_else(|| super::NetError::InvalidUrl(url.to_string()))?;
        let timestamp = self.clock.now_millis().to_string();
        let mut noise = [0u8; 8];
        OsRng.fill_bytes(&mut noise);
        let noise = hex::encode(noise);

        let signature = self.signature(host, &timestamp, &noise)?;
        Ok(vec![
            (HEADER_USER_AGENT.to_string(), Self::user_agent().to_string()),
            (HEADER_TIMESTAMP.to_string(), timestamp),
            (HEADER_NOISE.to_string(), noise),
            (HEADER_SIGNATURE.to_string(), signature),
        ])
    }

    /// Checks a signature produced by [`headers_for`](Self::headers_for).
    pub fn verify(&self, host: &str, timestamp: &str, noise: &str, signature: &str) -> bool {
        let Ok(expected) = self.signature(host, timestamp, noise) else {
            return false;
        };
        constant_time_eq(expected.as_bytes(), signature.as_bytes())
    }

    fn signature(&self, host: &str, timestamp: &str, noise: &str) -> Result<String, super::NetError> {
        let key = self
            .kds
            .derive(KeyPurpose::Signing, 32)
            .map_err(|e| {
                log::warn!("Signing key unavailable: {}", e);
                super::NetError::Signing
            })?;
        let message = format!("{}|{}|{}", host, timestamp, noise);
        let mac = hmac_sha256(key.as_bytes(), message.as_bytes());
        key.burn();
        Ok(hex::encode(mac))
    }
}
