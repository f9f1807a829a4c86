//! Configuration management for veilconf.
//!
//! Every field has a default, so a JSON file only needs to name what it
//! changes. The host application builds a [`VeilConfig`] (or loads one) and
//! hands it to [`crate::ConfigVault::builder`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fragment::FragmentSet;

/// Plaintext served when neither the network nor the cache yields anything.
pub const BUNDLED_DEFAULT_CONFIG: &str = "enabled=false\nversion=0\n";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VeilConfig {
    /// Encrypted bootstrap endpoint URLs, one fragment set per endpoint.
    pub bootstrap: Vec<FragmentSet>,

    /// Targets for decoy requests. Empty disables decoy traffic.
    pub decoy_urls: Vec<String>,

    /// Bundled plaintext returned as the last-resort fallback.
    pub default_config: String,

    /// Encrypted persistent store. `None` keeps the warm tier in memory only.
    pub storage_path: Option<PathBuf>,

    pub fingerprint: FingerprintConfig,
    pub kdf: KdfConfig,
    pub resolver: ResolverConfig,
    pub prober: ProberConfig,
    pub cache: CacheConfig,
    pub security: SecurityConfig,
    pub decoy: DecoyConfig,
    pub memory: MemoryConfig,
    pub pool: PoolConfig,
    pub tls: TlsConfig,
}

impl Default for VeilConfig {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            decoy_urls: vec![
                String::from("https://cdn.jsdelivr.net/gh/square/okhttp@master/README.md"),
                String::from("https://fastly.jsdelivr.net/gh/square/retrofit@master/README.md"),
                String::from("https://raw.githubusercontent.com/square/picasso/master/README.md"),
            ],
            default_config: String::from(BUNDLED_DEFAULT_CONFIG),
            storage_path: None,
            fingerprint: FingerprintConfig::default(),
            kdf: KdfConfig::default(),
            resolver: ResolverConfig::default(),
            prober: ProberConfig::default(),
            cache: CacheConfig::default(),
            security: SecurityConfig::default(),
            decoy: DecoyConfig::default(),
            memory: MemoryConfig::default(),
            pool: PoolConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl VeilConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Rejects settings that would make the pipeline misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resolver.attempts_per_endpoint == 0 {
            return Err(ConfigError::Invalid("attempts_per_endpoint must be at least 1".into()));
        }
        if self.resolver.backoff_min_ms > self.resolver.backoff_max_ms {
            return Err(ConfigError::Invalid("backoff_min_ms exceeds backoff_max_ms".into()));
        }
        if self.security.failure_threshold == 0 {
            return Err(ConfigError::Invalid("failure_threshold must be at least 1".into()));
        }
        if self.pool.worker_threads == 0 || self.pool.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid("worker pool must have capacity".into()));
        }
        if let Some(hex_id) = &self.fingerprint.fleet_fingerprint_hex {
            if hex::decode(hex_id).map(|b| b.is_empty()).unwrap_or(true) {
                return Err(ConfigError::Invalid("fleet_fingerprint_hex is not valid hex".into()));
            }
        }
        if let Err(e) = crate::net::pinning::SpkiPins::from_hex(&self.tls.pinned_spki_sha256) {
            return Err(ConfigError::Invalid(e.to_string()));
        }
        Ok(())
    }
}

/// How the device fingerprint is obtained.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Fleet-wide identity shared with the sealing tool. When unset, keys are
    /// bound to this host.
    pub fleet_fingerprint_hex: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// PBKDF2 rounds; anything below the floor is raised to it.
    pub rounds: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self { rounds: crate::crypto::kdf::MIN_KDF_ROUNDS }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Upper bound on one blocking `get_config` call, all retries included.
    pub resolve_timeout_ms: u64,
    pub fetch_timeout_ms: u64,
    pub attempts_per_endpoint: u32,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    /// Cache slot holding the main configuration.
    pub cache_key: String,
    /// Resolve in the background as soon as the vault is built.
    pub preload: bool,
    /// Minimum age of the last fresh fetch before a cached read triggers a
    /// background refresh. Zero disables background refresh.
    pub refresh_interval_secs: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            resolve_timeout_ms: 20_000,
            fetch_timeout_ms: 8_000,
            attempts_per_endpoint: 2,
            backoff_min_ms: 200,
            backoff_max_ms: 500,
            cache_key: String::from("cached_config"),
            preload: true,
            refresh_interval_secs: 30 * 60,
        }
    }
}

impl ResolverConfig {
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProberConfig {
    pub timeout_ms: u64,
    pub refresh_interval_secs: u64,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3_000,
            refresh_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 2 * 60 * 60 }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Consecutive quick-check failures that flip the process to compromised.
    pub failure_threshold: u32,
    pub watchdog_enabled: bool,
    pub check_interval_ms: u64,
    pub check_jitter_ms: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            watchdog_enabled: true,
            check_interval_ms: 30_000,
            check_jitter_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoyConfig {
    /// Decoy requests issued per real request.
    pub ratio: u32,
    pub max_start_delay_ms: u64,
    pub timeout_ms: u64,
}

impl Default for DecoyConfig {
    fn default() -> Self {
        Self {
            ratio: 2,
            max_start_delay_ms: 1_500,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Refuse to start when the OS reports less available memory than this.
    pub min_available_bytes: u64,
    pub noise_interval_ms: u64,
    pub noise_buffer_bytes: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            min_available_bytes: 16 * 1024 * 1024,
            noise_interval_ms: 3_000,
            noise_buffer_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub worker_threads: usize,
    pub max_concurrent_requests: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            max_concurrent_requests: 8,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Hex SHA-256 of accepted server `SubjectPublicKeyInfo`s. Empty disables
    /// pinning.
    pub pinned_spki_sha256: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = VeilConfig::from_json_str(
            r#"{ "security": { "failure_threshold": 5 }, "storage_path": "/tmp/veil.db" }"#,
        )
        .unwrap();
        assert_eq!(config.security.failure_threshold, 5);
        assert!(config.security.watchdog_enabled);
        assert_eq!(config.resolver.attempts_per_endpoint, 2);
        assert_eq!(config.storage_path, Some(PathBuf::from("/tmp/veil.db")));
        assert_eq!(config.default_config, BUNDLED_DEFAULT_CONFIG);
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let err = VeilConfig::from_json_str(r#"{ "security": { "failure_threshold": 0 } }"#);
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let err = VeilConfig::from_json_str(
            r#"{ "resolver": { "backoff_min_ms": 900, "backoff_max_ms": 100 } }"#,
        );
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_bad_fleet_hex() {
        let err = VeilConfig::from_json_str(
            r#"{ "fingerprint": { "fleet_fingerprint_hex": "zz" } }"#,
        );
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_short_pin() {
        let err = VeilConfig::from_json_str(r#"{ "tls": { "pinned_spki_sha256": ["7d64"] } }"#);
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(VeilConfig::from_json_str("{"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veil.json");
        std::fs::write(&path, r#"{ "decoy": { "ratio": 0 } }"#).unwrap();
        let config = VeilConfig::from_json_file(&path).unwrap();
        assert_eq!(config.decoy.ratio, 0);
    }
}
