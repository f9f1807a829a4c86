//! Secure channel resolution.
//!
//! # Pipeline
//! 1. **BootstrapDiscovery**: assemble every configured fragment set.
//! 2. **BootstrapFetch**: walk bootstrap endpoints (latency order when a
//!    ranking exists, shuffled otherwise) with per-endpoint retries.
//! 3. **BootstrapDecrypt**: open the manifest envelope with the `Content` key;
//!    it lists the real endpoints, one `https://` URL per line.
//! 4. **RealFetch**: walk the shuffled real endpoints the same way.
//! 5. **RealDecrypt**: open the payload with the `Main` key, cache it.
//!
//! Authentication, expiry and validation failures abandon the source without
//! retrying. Any failure ends in **Fallback**, which serves the best available
//! copy: unexpired cache, then last-known-good, then the bundled default.
//! Once the gate is closed, Fallback serves only the bundled default, even if
//! the gate closed mid-pipeline. Resolution never fails outward.

pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use zeroize::Zeroizing;

use crate::cache::{CacheLookup, CacheManager};
use crate::config::VeilConfig;
use crate::crypto::{AeadCodec, CryptoError, Envelope, KeyDerivationError, KeyDerivationService, KeyPurpose};
use crate::fragment::{is_plausible_url, FragmentAssembler, FragmentError, FragmentSet};
use crate::net::{
    DecoyTrafficGenerator, Endpoint, EndpointLatencyProber, EndpointTier, FetchRequest, NetError,
    RequestSigner, Transport,
};
use crate::security::SecurityGate;
use retry::RetryPolicy;

const KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStage {
    Start,
    BootstrapDiscovery,
    BootstrapFetch,
    BootstrapDecrypt,
    RealFetch,
    RealDecrypt,
    Done,
    Fallback,
}

/// Where a resolved configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Fresh,
    Cache,
    StaleCache,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub config: String,
    pub source: ConfigSource,
    pub trail: Vec<ResolveStage>,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Security gate closed")]
    GateClosed,
    #[error("No usable bootstrap endpoint")]
    NoBootstrap,
    #[error("Manifest lists no endpoints")]
    EmptyManifest,
    #[error("All endpoints failed, last error: {0}")]
    Exhausted(NetError),
    #[error("Payload is not valid UTF-8")]
    Encoding,
    #[error(transparent)]
    Key(#[from] KeyDerivationError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Fragment(#[from] FragmentError),
}

/// Collaborators wired in by [`crate::ConfigVault`].
pub struct ResolverDeps {
    pub kds: Arc<KeyDerivationService>,
    pub codec: Arc<AeadCodec>,
    pub prober: Arc<EndpointLatencyProber>,
    pub cache: Arc<CacheManager>,
    pub decoys: Arc<DecoyTrafficGenerator>,
    pub signer: Arc<RequestSigner>,
    pub transport: Arc<dyn Transport>,
    pub gate: Arc<dyn SecurityGate>,
}

pub struct SecureChannelResolver {
    deps: ResolverDeps,
    assembler: FragmentAssembler,
    bootstrap: Vec<FragmentSet>,
    retry: RetryPolicy,
    fetch_timeout: Duration,
    cache_key: String,
    cache_ttl: Duration,
    default_config: String,
}

impl SecureChannelResolver {
    pub fn new(deps: ResolverDeps, config: &VeilConfig) -> Self {
        Self {
            deps,
            assembler: FragmentAssembler::new(),
            bootstrap: config.bootstrap.clone(),
            retry: RetryPolicy::from_config(&config.resolver),
            fetch_timeout: config.resolver.fetch_timeout(),
            cache_key: config.resolver.cache_key.clone(),
            cache_ttl: config.cache.ttl(),
            default_config: config.default_config.clone(),
        }
    }

    pub fn default_config(&self) -> &str {
        &self.default_config
    }

    /// Serves a fresh cache hit without touching the network, otherwise
    /// runs [`resolve`](Self::resolve).
    pub async fn resolve_cached(&self) -> Resolution {
        if self.deps.gate.permits() {
            if let CacheLookup::Hit(config) = self.deps.cache.get(&self.cache_key) {
                log::debug!("Serving configuration from cache");
                return Resolution {
                    config,
                    source: ConfigSource::Cache,
                    trail: vec![ResolveStage::Start, ResolveStage::Done],
                };
            }
        }
        self.resolve().await
    }

    /// Full network resolution with fallback.
    pub async fn resolve(&self) -> Resolution {
        let mut trail = vec![ResolveStage::Start];
        if !self.deps.gate.permits() {
            log::warn!("Security gate closed, serving bundled default");
            trail.push(ResolveStage::Fallback);
            return self.default_resolution(trail);
        }

        match self.fetch_fresh(&mut trail).await {
            Ok(config) => {
                enter(&mut trail, ResolveStage::Done);
                Resolution { config, source: ConfigSource::Fresh, trail }
            }
            Err(e) => {
                log::warn!("Secure resolution failed: {}", e);
                enter(&mut trail, ResolveStage::Fallback);
                self.fallback(trail)
            }
        }
    }

    /// The result served when everything else failed.
    pub fn fallback_resolution(&self) -> Resolution {
        self.fallback(vec![ResolveStage::Start, ResolveStage::Fallback])
    }

    /// Bootstrap endpoints in the order they would be tried.
    pub fn bootstrap_endpoints(&self) -> Result<Vec<Endpoint>, ResolveError> {
        let key = self.deps.kds.derive(KeyPurpose::Bootstrap, KEY_LEN)?;
        let endpoints: Vec<Endpoint> = self
            .bootstrap
            .iter()
            .filter_map(|set| match self.assembler.assemble_set(set, key.as_bytes()) {
                Ok(url) => Some(Endpoint::new(url, EndpointTier::Bootstrap)),
                Err(e) => {
                    log::debug!("Skipping bootstrap fragment set: {}", e);
                    None
                }
            })
            .collect();
        key.burn();

        if endpoints.is_empty() {
            return Err(ResolveError::NoBootstrap);
        }
        Ok(self.order(endpoints))
    }

    fn order(&self, mut endpoints: Vec<Endpoint>) -> Vec<Endpoint> {
        if let Some(ranked) = self.deps.prober.rank(&endpoints) {
            return ranked;
        }
        endpoints.shuffle(&mut rand::thread_rng());
        endpoints
    }

    async fn fetch_fresh(&self, trail: &mut Vec<ResolveStage>) -> Result<String, ResolveError> {
        enter(trail, ResolveStage::BootstrapDiscovery);
        let bootstrap = self.bootstrap_endpoints()?;
        self.ensure_open()?;

        enter(trail, ResolveStage::BootstrapFetch);
        let urls: Vec<String> = bootstrap.into_iter().map(|e| e.url).collect();
        let body = self.fetch_first(&urls).await?;
        self.ensure_open()?;

        enter(trail, ResolveStage::BootstrapDecrypt);
        let manifest = self.open(&body, KeyPurpose::Content)?;
        let mut real = parse_manifest(&manifest);
        if real.is_empty() {
            return Err(ResolveError::EmptyManifest);
        }
        real.shuffle(&mut rand::thread_rng());
        self.ensure_open()?;

        enter(trail, ResolveStage::RealFetch);
        let body = self.fetch_first(&real).await?;
        self.ensure_open()?;

        enter(trail, ResolveStage::RealDecrypt);
        let plaintext = self.open(&body, KeyPurpose::Main)?;
        let config = std::str::from_utf8(&plaintext)
            .map_err(|_| ResolveError::Encoding)?
            .to_string();

        if let Err(e) = self.deps.cache.put(&self.cache_key, &config, self.cache_ttl) {
            log::warn!("Failed to cache configuration: {}", e);
        }
        Ok(config)
    }

    fn ensure_open(&self) -> Result<(), ResolveError> {
        if self.deps.gate.permits() {
            Ok(())
        } else {
            Err(ResolveError::GateClosed)
        }
    }

    /// First successful body among `urls`, each with its own retry budget.
    async fn fetch_first(&self, urls: &[String]) -> Result<Vec<u8>, ResolveError> {
        let mut last_error = NetError::Transient("no endpoints".into());
        for (index, url) in urls.iter().enumerate() {
            match self.retry.run(|_| self.fetch_once(url)).await {
                Ok(body) => return Ok(body),
                Err(e) => {
                    log::debug!("Endpoint #{} failed: {}", index, e);
                    last_error = e;
                }
            }
        }
        Err(ResolveError::Exhausted(last_error))
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<u8>, NetError> {
        let headers = self.deps.signer.headers_for(url)?;
        let request = FetchRequest::get(url, self.fetch_timeout).with_headers(headers);
        let response = self.deps.decoys.shield(self.deps.transport.fetch(&request)).await?;
        Ok(response.into_success()?.body)
    }

    fn open(&self, body: &[u8], purpose: KeyPurpose) -> Result<Zeroizing<Vec<u8>>, ResolveError> {
        let text = std::str::from_utf8(body).map_err(|_| CryptoError::Malformed("envelope is not utf-8"))?;
        let envelope = Envelope::from_json(text)?;
        let key = self.deps.kds.derive(purpose, KEY_LEN)?;
        let opened = self.deps.codec.open_envelope(&envelope, key.as_bytes());
        key.burn();
        Ok(opened?)
    }

    fn fallback(&self, trail: Vec<ResolveStage>) -> Resolution {
        if !self.deps.gate.permits() {
            log::warn!("Security gate closed, withholding cached configuration");
            return self.default_resolution(trail);
        }
        if let CacheLookup::Hit(config) = self.deps.cache.get(&self.cache_key) {
            log::info!("Falling back to cached configuration");
            return Resolution { config, source: ConfigSource::Cache, trail };
        }
        if let Some(config) = self.deps.cache.last_known_good(&self.cache_key) {
            log::info!("Falling back to last-known-good configuration");
            return Resolution { config, source: ConfigSource::StaleCache, trail };
        }
        log::info!("Falling back to bundled default configuration");
        self.default_resolution(trail)
    }

    fn default_resolution(&self, trail: Vec<ResolveStage>) -> Resolution {
        Resolution {
            config: self.default_config.clone(),
            source: ConfigSource::Default,
            trail,
        }
    }
}

fn enter(trail: &mut Vec<ResolveStage>, stage: ResolveStage) {
    log::debug!("Resolver stage: {:?}", stage);
    trail.push(stage);
}

/// Real endpoints listed in a decrypted manifest.
pub fn parse_manifest(manifest: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(manifest)
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("https://") && is_plausible_url(line))
        .map(str::to_string)
        .collect()
}
