//! Consumer-facing entry point.
//!
//! [`ConfigVault`] owns every service and wires them together once. Nothing
//! it exposes can fail: callers always get a configuration string back, at
//! worst the bundled default.
//!
//! Reads are stale-while-revalidate: the vault preloads on build, serves a
//! cached value at once and refreshes it on the worker pool when the last
//! fresh fetch is older than `resolver.refresh_interval_secs`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::cache::CacheManager;
use crate::config::{ConfigError, VeilConfig};
use crate::crypto::fingerprint::FingerprintError;
use crate::crypto::{
    AeadCodec, FingerprintSource, HostFingerprint, KeyDerivationError, KeyDerivationService, KeyPurpose,
    StaticFingerprint,
};
use crate::fragment::FragmentAssembler;
use crate::memory::{MemoryError, ProtectedMemoryStore};
use crate::net::{DecoyTrafficGenerator, EndpointLatencyProber, NetError, RequestSigner, Transport};
use crate::platform::{Clock, EnvironmentProbe, PcPlatform, SystemClock};
use crate::pool::{PoolError, WorkerPool};
use crate::resolver::{ConfigSource, Resolution, ResolveStage, ResolverDeps, SecureChannelResolver};
use crate::security::{SecurityState, SecurityStateMachine, TamperCheck, TamperDetectionEngine, ViolationCallback};
use crate::storage::{EncryptedStore, StorageError};
use crate::watchdog::WatchdogError;

const IGNORED_VERSION_PREF: &str = "ignored_version";

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Fleet fingerprint unusable: {0}")]
    Fingerprint(#[from] FingerprintError),
    #[error(transparent)]
    Key(#[from] KeyDerivationError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("Persistent store unavailable: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Watchdog(#[from] WatchdogError),
    #[error("HTTP transport unavailable: {0}")]
    Transport(#[from] NetError),
    #[error("No transport configured")]
    NoTransport,
}

/// The two fields of a configuration the presentation layer acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSummary {
    pub enabled: bool,
    pub version: Option<String>,
}

impl ConfigSummary {
    /// Reads `enabled` and `version` from a JSON object or from `key=value`
    /// lines. A missing `enabled` counts as enabled.
    pub fn parse(config: &str) -> Self {
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(config) {
            let enabled = match map.get("enabled") {
                Some(serde_json::Value::Bool(b)) => *b,
                Some(serde_json::Value::String(s)) => truthy(s),
                _ => true,
            };
            let version = match map.get("version") {
                Some(serde_json::Value::String(s)) => Some(s.clone()),
                Some(serde_json::Value::Number(n)) => Some(n.to_string()),
                _ => None,
            };
            return Self { enabled, version: version.filter(|v| !v.is_empty()) };
        }

        let mut summary = Self { enabled: true, version: None };
        for line in config.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key.trim() {
                "enabled" => summary.enabled = truthy(value.trim()),
                "version" => {
                    let value = value.trim();
                    summary.version = (!value.is_empty()).then(|| value.to_string());
                }
                _ => {}
            }
        }
        summary
    }
}

fn truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "on" | "1" | "yes")
}

/// Bookkeeping for background refreshes.
struct Refresher {
    clock: Arc<dyn Clock>,
    interval_ms: u64,
    last_fresh_ms: AtomicU64,
    in_flight: AtomicBool,
}

impl Refresher {
    fn new(clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            clock,
            interval_ms: interval.as_millis() as u64,
            last_fresh_ms: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
        }
    }

    fn note(&self, resolution: &Resolution) {
        if resolution.source == ConfigSource::Fresh {
            self.last_fresh_ms.store(self.clock.now_millis(), Ordering::SeqCst);
        }
    }

    /// Claims the refresh slot when a refresh is due and none is running.
    fn claim(&self) -> bool {
        if self.interval_ms == 0 {
            return false;
        }
        let age = self
            .clock
            .now_millis()
            .saturating_sub(self.last_fresh_ms.load(Ordering::SeqCst));
        age >= self.interval_ms
            && self
                .in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    fn release(&self) {
        self.in_flight.store(false, Ordering::SeqCst);
    }
}

pub struct ConfigVaultBuilder {
    config: VeilConfig,
    transport: Option<Arc<dyn Transport>>,
    probe: Option<Arc<dyn EnvironmentProbe>>,
    fingerprint: Option<Box<dyn FingerprintSource>>,
    clock: Option<Arc<dyn Clock>>,
    extensions: Vec<Box<dyn TamperCheck>>,
}

impl ConfigVaultBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn EnvironmentProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Overrides both the host fingerprint and any configured fleet identity.
    pub fn fingerprint(mut self, source: Box<dyn FingerprintSource>) -> Self {
        self.fingerprint = Some(source);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Adds a check to the deep battery.
    pub fn tamper_check(mut self, check: Box<dyn TamperCheck>) -> Self {
        self.extensions.push(check);
        self
    }

    pub fn build(self) -> Result<ConfigVault, VaultError> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let probe = self.probe.unwrap_or_else(|| Arc::new(PcPlatform::new()));
        let source: Box<dyn FingerprintSource> = match (self.fingerprint, &config.fingerprint.fleet_fingerprint_hex) {
            (Some(source), _) => source,
            (None, Some(hex_id)) => Box::new(StaticFingerprint::from_hex(hex_id)?),
            (None, None) => Box::new(HostFingerprint::new(Arc::clone(&probe))),
        };
        let kds = Arc::new(KeyDerivationService::new(source.as_ref(), config.kdf.rounds));
        drop(source);

        let memory = Arc::new(ProtectedMemoryStore::new(&config.memory, probe.as_ref())?);
        let store_key = kds.derive(KeyPurpose::Storage, 32)?;
        let store = match &config.storage_path {
            Some(path) => EncryptedStore::open_or_reset(path, store_key.as_bytes()),
            None => EncryptedStore::new_memory(store_key.as_bytes()),
        };
        store_key.burn();
        let cache = Arc::new(CacheManager::new(Arc::clone(&memory), store?, Arc::clone(&clock)));

        let pool = WorkerPool::new(&config.pool)?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport(&config)?,
        };
        let transport = pool.bound(transport);

        let signer = Arc::new(RequestSigner::new(Arc::clone(&kds), Arc::clone(&clock)));
        let decoys = Arc::new(DecoyTrafficGenerator::new(
            Arc::clone(&transport),
            Arc::clone(&signer),
            config.decoy_urls.clone(),
            config.decoy.clone(),
        ));
        let prober = Arc::new(EndpointLatencyProber::new(
            Arc::clone(&transport),
            Duration::from_millis(config.prober.timeout_ms),
        ));

        let engine = self
            .extensions
            .into_iter()
            .fold(TamperDetectionEngine::new(Arc::clone(&probe)), |engine, check| engine.with_extension(check));
        let security = Arc::new(SecurityStateMachine::new(
            engine,
            Arc::clone(&memory),
            Arc::clone(&clock),
            config.security.failure_threshold,
        ));

        let refresher = Arc::new(Refresher::new(Arc::clone(&clock), config.resolver.refresh_interval()));
        let resolver = Arc::new(SecureChannelResolver::new(
            ResolverDeps {
                kds,
                codec: Arc::new(AeadCodec::new(clock)),
                prober: Arc::clone(&prober),
                cache: Arc::clone(&cache),
                decoys,
                signer,
                transport,
                gate: security.clone(),
            },
            &config,
        ));

        let mut background = Vec::new();
        if config.memory.noise_interval_ms > 0 {
            background.push(memory.spawn_noise_sweeper(
                pool.handle(),
                Duration::from_millis(config.memory.noise_interval_ms),
            ));
        }
        if config.prober.refresh_interval_secs > 0 {
            match resolver.bootstrap_endpoints() {
                Ok(endpoints) => background.push(prober.spawn_refresh(
                    pool.handle(),
                    endpoints,
                    Duration::from_secs(config.prober.refresh_interval_secs),
                )),
                Err(e) => log::debug!("Latency probing disabled: {}", e),
            }
        }
        if config.resolver.preload {
            let (resolver, security, refresher) =
                (Arc::clone(&resolver), Arc::clone(&security), Arc::clone(&refresher));
            background.push(pool.handle().spawn(async move {
                if !security.check() {
                    log::warn!("Security check failed, skipping preload");
                    return;
                }
                let resolution = resolver.resolve_cached().await;
                refresher.note(&resolution);
                log::debug!("Preload served {:?}", resolution.source);
            }));
        }
        if config.security.watchdog_enabled {
            security.start_watchdog(
                Duration::from_millis(config.security.check_interval_ms),
                Duration::from_millis(config.security.check_jitter_ms),
            )?;
        }

        log::info!("Config vault ready");
        Ok(ConfigVault {
            resolver,
            security,
            cache,
            pool,
            refresher,
            background: Mutex::new(background),
            resolve_timeout: config.resolver.resolve_timeout(),
        })
    }
}

#[cfg(feature = "http")]
fn default_transport(config: &VeilConfig) -> Result<Arc<dyn Transport>, VaultError> {
    Ok(Arc::new(crate::net::http::ReqwestTransport::new(&config.tls)?))
}

#[cfg(not(feature = "http"))]
fn default_transport(_config: &VeilConfig) -> Result<Arc<dyn Transport>, VaultError> {
    Err(VaultError::NoTransport)
}

pub struct ConfigVault {
    resolver: Arc<SecureChannelResolver>,
    security: Arc<SecurityStateMachine>,
    cache: Arc<CacheManager>,
    pool: WorkerPool,
    refresher: Arc<Refresher>,
    background: Mutex<Vec<JoinHandle<()>>>,
    resolve_timeout: Duration,
}

impl ConfigVault {
    pub fn builder(config: VeilConfig) -> ConfigVaultBuilder {
        ConfigVaultBuilder {
            config,
            transport: None,
            probe: None,
            fingerprint: None,
            clock: None,
            extensions: Vec::new(),
        }
    }

    /// The current configuration. Blocks for at most the resolve timeout.
    pub fn get_config(&self) -> String {
        self.get_resolution().config
    }

    /// Like [`get_config`](Self::get_config), reporting where the value came
    /// from.
    pub fn get_resolution(&self) -> Resolution {
        if let Some(refused) = self.refuse() {
            return refused;
        }
        let resolver = Arc::clone(&self.resolver);
        let resolution = match self
            .pool
            .block_on_timeout(async move { resolver.resolve_cached().await }, self.resolve_timeout)
        {
            Some(resolution) => resolution,
            None => {
                log::warn!("Configuration resolution timed out");
                self.resolver.fallback_resolution()
            }
        };
        self.revalidate(&resolution);
        resolution
    }

    pub async fn get_config_async(&self) -> String {
        if let Some(refused) = self.refuse() {
            return refused.config;
        }
        let resolver = Arc::clone(&self.resolver);
        let task = self.pool.handle().spawn(async move { resolver.resolve_cached().await });
        let resolution = match tokio::time::timeout(self.resolve_timeout, task).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(e)) => {
                log::warn!("Resolution task failed: {}", e);
                self.resolver.fallback_resolution()
            }
            Err(_) => {
                log::warn!("Configuration resolution timed out");
                self.resolver.fallback_resolution()
            }
        };
        self.revalidate(&resolution);
        resolution.config
    }

    /// Records fresh results and refreshes cached ones in the background.
    fn revalidate(&self, resolution: &Resolution) {
        self.refresher.note(resolution);
        if resolution.source != ConfigSource::Cache || !self.refresher.claim() {
            return;
        }
        log::debug!("Refreshing cached configuration in the background");
        let (resolver, refresher) = (Arc::clone(&self.resolver), Arc::clone(&self.refresher));
        self.pool.handle().spawn(async move {
            let resolution = resolver.resolve().await;
            refresher.note(&resolution);
            refresher.release();
            log::debug!("Background refresh served {:?}", resolution.source);
        });
    }

    /// Runs the pre-flight security check. A failed check serves what is
    /// already cached without touching the network; a compromised process
    /// only ever gets the bundled default.
    fn refuse(&self) -> Option<Resolution> {
        if self.security.check() {
            return None;
        }
        if self.security.is_compromised() {
            return Some(Resolution {
                config: self.resolver.default_config().to_string(),
                source: ConfigSource::Default,
                trail: vec![ResolveStage::Start, ResolveStage::Fallback],
            });
        }
        Some(self.resolver.fallback_resolution())
    }

    /// Best bootstrap endpoint, or a plausible fabricated one when the
    /// process is compromised or no endpoint can be assembled.
    pub fn get_secure_endpoint(&self) -> String {
        if !self.security.check() {
            return FragmentAssembler::new().fabricated_endpoint();
        }
        match self.resolver.bootstrap_endpoints() {
            Ok(endpoints) => match endpoints.into_iter().next() {
                Some(endpoint) => endpoint.url,
                None => FragmentAssembler::new().fabricated_endpoint(),
            },
            Err(e) => {
                log::debug!("No secure endpoint: {}", e);
                FragmentAssembler::new().fabricated_endpoint()
            }
        }
    }

    /// Whether the presentation layer should act on `config`.
    pub fn should_present(&self, config: &str) -> bool {
        let summary = ConfigSummary::parse(config);
        if !summary.enabled {
            log::info!("Configuration disabled");
            return false;
        }
        match (summary.version, self.cache.preference(IGNORED_VERSION_PREF)) {
            (Some(version), Some(ignored)) if version == ignored => {
                log::info!("Configuration version {} is ignored", version);
                false
            }
            _ => true,
        }
    }

    /// Suppresses `version` in future [`should_present`](Self::should_present)
    /// calls. Empty versions are ignored.
    pub fn ignore_version(&self, version: &str) {
        if version.is_empty() {
            return;
        }
        match self.cache.set_preference(IGNORED_VERSION_PREF, version) {
            Ok(()) => log::info!("Version ignored: {}", version),
            Err(e) => log::warn!("Failed to store ignored version: {}", e),
        }
    }

    pub fn security_state(&self) -> SecurityState {
        self.security.state()
    }

    pub fn on_violation(&self, callback: ViolationCallback) {
        self.security.on_violation(callback);
    }

    pub fn deep_check(&self) -> bool {
        self.security.deep_check()
    }

    /// Stops background work and the worker runtime.
    pub fn shutdown(self) {
        self.security.stop_watchdog();
        for task in self.background.lock().drain(..) {
            task.abort();
        }
        self.pool.shutdown();
        log::info!("Config vault shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheLookup;
    use crate::config::BUNDLED_DEFAULT_CONFIG;
    use crate::seal::Sealer;
    use crate::security::TamperError;
    use crate::testing::{test_kdf, FakeProbe, FakeTransport, TEST_FLEET_ID};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    const BOOT: &str = "https://boot.example.com/manifest.json";
    const REAL: &str = "https://content.example.org/config.json";
    const PAYLOAD: &str = "enabled=true\nversion=12\ntitle=Maintenance window\n";
    const UPDATED: &str = "enabled=true\nversion=13\ntitle=Maintenance over\n";
    const DAY: Duration = Duration::from_secs(86_400);

    fn sealer() -> Sealer {
        Sealer::new(test_kdf(), Arc::new(SystemClock))
    }

    fn test_config() -> VeilConfig {
        let mut config = VeilConfig::default();
        config.fingerprint.fleet_fingerprint_hex = Some(hex::encode(TEST_FLEET_ID));
        config.bootstrap = vec![sealer().fragment(BOOT, 5).unwrap()];
        config.decoy_urls = Vec::new();
        config.resolver.backoff_min_ms = 1;
        config.resolver.backoff_max_ms = 2;
        config.resolver.resolve_timeout_ms = 5_000;
        config.prober.refresh_interval_secs = 0;
        config.security.watchdog_enabled = false;
        config.pool.worker_threads = 2;
        config.resolver.preload = false;
        config
    }

    fn serving_transport() -> Arc<FakeTransport> {
        serving(PAYLOAD)
    }

    fn serving(payload: &str) -> Arc<FakeTransport> {
        let sealer = sealer();
        let fake = Arc::new(FakeTransport::new());
        let manifest = sealer.seal_manifest(&[REAL.to_string()], DAY).unwrap();
        let payload = sealer.seal_payload(payload.as_bytes(), DAY).unwrap();
        fake.respond(BOOT, 200, manifest.to_json().as_bytes());
        fake.respond(REAL, 200, payload.to_json().as_bytes());
        fake
    }

    fn vault(config: VeilConfig, fake: Arc<FakeTransport>, probe: FakeProbe) -> ConfigVault {
        ConfigVault::builder(config)
            .transport(fake)
            .probe(Arc::new(probe))
            .build()
            .unwrap()
    }

    /// Fails whenever the shared switch is on.
    struct Switch(Arc<AtomicBool>);

    impl TamperCheck for Switch {
        fn name(&self) -> &'static str {
            "switch"
        }

        fn check(&self) -> Result<(), TamperError> {
            if self.0.load(Ordering::SeqCst) {
                Err(TamperError::ViolationDetected("switch"))
            } else {
                Ok(())
            }
        }
    }

    fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn test_get_config_end_to_end() {
        let fake = serving_transport();
        let vault = vault(test_config(), fake.clone(), FakeProbe::clean());

        let first = vault.get_resolution();
        assert_eq!(first.source, ConfigSource::Fresh);
        assert_eq!(first.config, PAYLOAD);
        assert_eq!(fake.count_for(BOOT), 1);
        assert_eq!(fake.count_for(REAL), 1);

        let requests = fake.total();
        assert_eq!(vault.get_config(), PAYLOAD);
        assert_eq!(fake.total(), requests);
        vault.shutdown();
    }

    #[test]
    fn test_unreachable_network_serves_default() {
        let vault = vault(test_config(), Arc::new(FakeTransport::new()), FakeProbe::clean());
        let resolution = vault.get_resolution();
        assert_eq!(resolution.source, ConfigSource::Default);
        assert_eq!(resolution.config, BUNDLED_DEFAULT_CONFIG);
        assert!(!vault.should_present(&resolution.config));
    }

    #[test]
    fn test_slow_network_times_out_to_default() {
        let fake = serving_transport();
        fake.delay(BOOT, Duration::from_secs(30));
        let mut config = test_config();
        config.resolver.resolve_timeout_ms = 100;
        let vault = vault(config, fake, FakeProbe::clean());

        let started = std::time::Instant::now();
        assert_eq!(vault.get_config(), BUNDLED_DEFAULT_CONFIG);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_hostile_host_never_touches_network() {
        let fake = serving_transport();
        let vault = vault(test_config(), fake.clone(), FakeProbe::hostile());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        vault.on_violation(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        for _ in 0..4 {
            assert_eq!(vault.get_config(), BUNDLED_DEFAULT_CONFIG);
        }
        assert!(vault.security_state().compromised);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_ne!(vault.get_secure_endpoint(), BOOT);
        assert!(!vault.deep_check());
        assert_eq!(fake.total(), 0);
    }

    #[test]
    fn test_secure_endpoint_is_the_bootstrap_url() {
        let vault = vault(test_config(), Arc::new(FakeTransport::new()), FakeProbe::clean());
        assert_eq!(vault.get_secure_endpoint(), BOOT);
    }

    #[test]
    fn test_ignore_version_suppresses_presentation() {
        let vault = vault(test_config(), serving_transport(), FakeProbe::clean());
        let config = vault.get_config();
        assert!(vault.should_present(&config));

        vault.ignore_version("12");
        assert!(!vault.should_present(&config));
        assert!(vault.should_present("enabled=true\nversion=13"));
        vault.ignore_version("");
        assert!(!vault.should_present(&config));
    }

    #[test]
    fn test_persistent_cache_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.storage_path = Some(dir.path().join("vault.bin"));
        config.resolver.refresh_interval_secs = 0;

        let first = vault(config.clone(), serving_transport(), FakeProbe::clean());
        assert_eq!(first.get_resolution().source, ConfigSource::Fresh);
        first.shutdown();

        let offline = Arc::new(FakeTransport::new());
        let second = vault(config, offline.clone(), FakeProbe::clean());
        let resolution = second.get_resolution();
        assert_eq!(resolution.source, ConfigSource::Cache);
        assert_eq!(resolution.config, PAYLOAD);
        assert_eq!(offline.total(), 0);
    }

    #[test]
    fn test_changed_device_key_starts_with_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.storage_path = Some(dir.path().join("vault.bin"));
        let build = |identity: &[u8]| {
            ConfigVault::builder(config.clone())
                .transport(Arc::new(FakeTransport::new()))
                .probe(Arc::new(FakeProbe::clean()))
                .fingerprint(Box::new(StaticFingerprint::new(identity.to_vec())))
                .build()
        };

        let first = build(b"host-a").unwrap();
        first.ignore_version("1");
        assert!(!first.should_present("version=1"));
        first.shutdown();

        let second = build(b"host-b").unwrap();
        assert!(second.should_present("version=1"));
        second.ignore_version("2");
        second.shutdown();
        assert!(dir.path().join("vault.bin.unreadable").exists());

        let third = build(b"host-b").unwrap();
        assert!(!third.should_present("version=2"));
        third.shutdown();
    }

    #[test]
    fn test_preload_fills_cache_on_build() {
        let fake = serving_transport();
        let mut config = test_config();
        config.resolver.preload = true;
        config.resolver.refresh_interval_secs = 0;
        let vault = vault(config, fake.clone(), FakeProbe::clean());

        assert!(wait_until(Duration::from_secs(5), || {
            matches!(vault.cache.get("cached_config"), CacheLookup::Hit(_))
        }));
        let requests = fake.total();
        let resolution = vault.get_resolution();
        assert_eq!(resolution.source, ConfigSource::Cache);
        assert_eq!(resolution.config, PAYLOAD);
        assert_eq!(fake.total(), requests);
        vault.shutdown();
    }

    #[test]
    fn test_cached_read_refreshes_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.storage_path = Some(dir.path().join("vault.bin"));

        let first = vault(config.clone(), serving(PAYLOAD), FakeProbe::clean());
        assert_eq!(first.get_resolution().source, ConfigSource::Fresh);
        first.shutdown();

        let fake = serving(UPDATED);
        fake.delay(BOOT, Duration::from_millis(500));
        let second = vault(config, fake.clone(), FakeProbe::clean());
        let started = Instant::now();
        let stale = second.get_resolution();
        assert_eq!(stale.source, ConfigSource::Cache);
        assert_eq!(stale.config, PAYLOAD);
        assert!(started.elapsed() < Duration::from_millis(500));

        assert!(wait_until(Duration::from_secs(5), || second.get_config() == UPDATED));
        assert_eq!(fake.count_for(REAL), 1);
        second.shutdown();
    }

    #[test]
    fn test_compromise_withholds_populated_cache() {
        let tripped = Arc::new(AtomicBool::new(false));
        let fake = serving_transport();
        let vault = ConfigVault::builder(test_config())
            .transport(fake.clone())
            .probe(Arc::new(FakeProbe::clean()))
            .tamper_check(Box::new(Switch(tripped.clone())))
            .build()
            .unwrap();
        assert_eq!(vault.get_config(), PAYLOAD);

        tripped.store(true, Ordering::SeqCst);
        assert!(!vault.deep_check());
        assert!(vault.security_state().compromised);

        let requests = fake.total();
        let resolution = vault.get_resolution();
        assert_eq!(resolution.source, ConfigSource::Default);
        assert_eq!(resolution.config, BUNDLED_DEFAULT_CONFIG);
        assert_eq!(vault.resolver.fallback_resolution().config, BUNDLED_DEFAULT_CONFIG);
        assert_ne!(vault.get_secure_endpoint(), BOOT);
        assert_eq!(fake.total(), requests);
        vault.shutdown();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = test_config();
        config.resolver.attempts_per_endpoint = 0;
        let result = ConfigVault::builder(config)
            .transport(Arc::new(FakeTransport::new()))
            .probe(Arc::new(FakeProbe::clean()))
            .build();
        assert!(matches!(result, Err(VaultError::Config(_))));
    }

    #[tokio::test]
    async fn test_get_config_async() {
        let vault = vault(test_config(), serving_transport(), FakeProbe::clean());
        assert_eq!(vault.get_config_async().await, PAYLOAD);
        // Dropping a runtime inside an async context panics; shut it down
        // from a blocking thread.
        tokio::task::spawn_blocking(move || vault.shutdown()).await.unwrap();
    }

    #[test]
    fn test_summary_parsing() {
        assert_eq!(
            ConfigSummary::parse("enabled=yes\nversion = 3.1\n"),
            ConfigSummary { enabled: true, version: Some("3.1".into()) }
        );
        assert_eq!(
            ConfigSummary::parse("title=x\nenabled=off"),
            ConfigSummary { enabled: false, version: None }
        );
        assert_eq!(
            ConfigSummary::parse(r#"{"enabled": true, "version": 7}"#),
            ConfigSummary { enabled: true, version: Some("7".into()) }
        );
        assert_eq!(
            ConfigSummary::parse(r#"{"title": "x"}"#),
            ConfigSummary { enabled: true, version: None }
        );
        assert!(!ConfigSummary::parse(BUNDLED_DEFAULT_CONFIG).enabled);
    }
}
