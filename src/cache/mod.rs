//! Two-tier cache for verified plaintext.
//!
//! - **Hot**: [`ProtectedMemoryStore`] regions indexed by a `DashMap`.
//! - **Warm**: [`EncryptedStore`] records under `cache/<key>`, checked
//!   against an integrity hash and their TTL on every read.
//!
//! Every `put` also refreshes a TTL-free last-known-good record under
//! `lkg/<key>`, which only the resolver's fallback path reads.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::crypto::sha256;
use crate::memory::{MemoryError, MemoryHandle, ProtectedMemoryStore};
use crate::platform::Clock;
use crate::storage::{EncryptedStore, StorageError};

const CACHE_PREFIX: &str = "cache/";
const LKG_PREFIX: &str = "lkg/";
const PREFS_PREFIX: &str = "prefs/";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("Failed to encode cache entry: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(String),
    Miss,
}

impl CacheLookup {
    pub fn into_option(self) -> Option<String> {
        match self {
            CacheLookup::Hit(value) => Some(value),
            CacheLookup::Miss => None,
        }
    }
}

/// Persisted form of one cached value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: String,
    pub stored_at: u64,
    pub ttl_ms: u64,
    pub integrity_hash: String,
}

impl CacheEntry {
    fn new(key: &str, value: &str, stored_at: u64, ttl_ms: u64) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            stored_at,
            ttl_ms,
            integrity_hash: Self::digest(key, value, stored_at, ttl_ms),
        }
    }

    fn digest(key: &str, value: &str, stored_at: u64, ttl_ms: u64) -> String {
        let material = format!("{}|{}|{}|{}", key, stored_at, ttl_ms, value);
        hex::encode(sha256(material.as_bytes()))
    }

    pub fn is_intact(&self) -> bool {
        let expected = Self::digest(&self.key, &self.value, self.stored_at, self.ttl_ms);
        crate::crypto::constant_time_eq(expected.as_bytes(), self.integrity_hash.as_bytes())
    }

    pub fn is_fresh(&self, now: u64) -> bool {
        self.stored_at.saturating_add(self.ttl_ms) > now
    }
}

struct HotEntry {
    handle: MemoryHandle,
    len: usize,
    stored_at: u64,
    ttl_ms: u64,
}

pub struct CacheManager {
    hot: DashMap<String, HotEntry>,
    memory: Arc<ProtectedMemoryStore>,
    store: Mutex<EncryptedStore>,
    clock: Arc<dyn Clock>,
}

impl CacheManager {
    pub fn new(memory: Arc<ProtectedMemoryStore>, store: EncryptedStore, clock: Arc<dyn Clock>) -> Self {
        Self { hot: DashMap::new(), memory, store: Mutex::new(store), clock }
    }

    pub fn get(&self, key: &str) -> CacheLookup {
        let now = self.clock.now_millis();
        if let Some(value) = self.get_hot(key, now) {
            return CacheLookup::Hit(value);
        }

        let slot = format!("{}{}", CACHE_PREFIX, key);
        let mut store = self.store.lock();
        let Some(entry) = decode_entry(store.get(&slot)) else {
            return CacheLookup::Miss;
        };
        if entry.key != key || !entry.is_intact() || !entry.is_fresh(now) {
            log::debug!("Purging stale or damaged cache entry");
            store.remove(&slot);
            if let Err(e) = store.save() {
                log::warn!("Failed to persist cache purge: {}", e);
            }
            return CacheLookup::Miss;
        }
        drop(store);

        if let Err(e) = self.put_hot(key, &entry.value, entry.stored_at, entry.ttl_ms) {
            log::debug!("Hot tier back-fill failed: {}", e);
        }
        CacheLookup::Hit(entry.value)
    }

    fn get_hot(&self, key: &str, now: u64) -> Option<String> {
        let value = {
            let entry = self.hot.get(key)?;
            if entry.stored_at.saturating_add(entry.ttl_ms) > now {
                let bytes = self.memory.read(&entry.handle);
                (bytes.len() == entry.len)
                    .then(|| String::from_utf8(bytes.to_vec()).ok())
                    .flatten()
            } else {
                None
            }
        };
        if value.is_none() {
            self.evict_hot(key);
        }
        value
    }

    fn put_hot(&self, key: &str, value: &str, stored_at: u64, ttl_ms: u64) -> Result<(), MemoryError> {
        let handle = self.memory.allocate(key)?;
        self.memory.write(&handle, value.as_bytes())?;
        let previous = self.hot.insert(
            key.to_string(),
            HotEntry { handle, len: value.len(), stored_at, ttl_ms },
        );
        if let Some(previous) = previous {
            self.memory.clear(&previous.handle);
        }
        Ok(())
    }

    fn evict_hot(&self, key: &str) {
        if let Some((_, entry)) = self.hot.remove(key) {
            self.memory.clear(&entry.handle);
        }
    }

    /// Stores `value` in both tiers and refreshes its last-known-good copy.
    pub fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let now = self.clock.now_millis();
        let ttl_ms = ttl.as_millis() as u64;

        if let Err(e) = self.put_hot(key, value, now, ttl_ms) {
            log::warn!("Hot tier unavailable: {}", e);
        }

        let entry = serde_json::to_vec(&CacheEntry::new(key, value, now, ttl_ms))?;
        let lkg = serde_json::to_vec(&CacheEntry::new(key, value, now, 0))?;
        let mut store = self.store.lock();
        store.set(&format!("{}{}", CACHE_PREFIX, key), &entry);
        store.set(&format!("{}{}", LKG_PREFIX, key), &lkg);
        store.save()?;
        Ok(())
    }

    /// Last value stored under `key`, regardless of age. Integrity is still
    /// enforced.
    pub fn last_known_good(&self, key: &str) -> Option<String> {
        let store = self.store.lock();
        let entry = decode_entry(store.get(&format!("{}{}", LKG_PREFIX, key)))?;
        (entry.key == key && entry.is_intact()).then_some(entry.value)
    }

    /// Drops the cached value from both tiers. The last-known-good copy stays.
    pub fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.evict_hot(key);
        let mut store = self.store.lock();
        if store.remove(&format!("{}{}", CACHE_PREFIX, key)) {
            store.save()?;
        }
        Ok(())
    }

    pub fn preference(&self, name: &str) -> Option<String> {
        let store = self.store.lock();
        let raw = store.get(&format!("{}{}", PREFS_PREFIX, name))?;
        String::from_utf8(raw.to_vec()).ok()
    }

    pub fn set_preference(&self, name: &str, value: &str) -> Result<(), CacheError> {
        let mut store = self.store.lock();
        store.set(&format!("{}{}", PREFS_PREFIX, name), value.as_bytes());
        store.save()?;
        Ok(())
    }

    /// Number of entries currently held in the hot tier.
    pub fn hot_len(&self) -> usize {
        self.hot.len()
    }
}

fn decode_entry(raw: Option<&[u8]>) -> Option<CacheEntry> {
    serde_json::from_slice(raw?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::platform::ManualClock;
    use crate::testing::FakeProbe;

    const KEY: [u8; 32] = [0x21; 32];
    const HOUR: Duration = Duration::from_secs(3600);
    const MINUTE: u64 = 60_000;

    fn memory() -> Arc<ProtectedMemoryStore> {
        Arc::new(ProtectedMemoryStore::new(&MemoryConfig::default(), &FakeProbe::clean()).unwrap())
    }

    fn manager(store: EncryptedStore) -> (CacheManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (CacheManager::new(memory(), store, clock.clone()), clock)
    }

    #[test]
    fn test_ttl_59_vs_61_minutes() {
        let (cache, clock) = manager(EncryptedStore::new_memory(&KEY).unwrap());
        cache.put("cached_config", "enabled=true", HOUR).unwrap();

        clock.advance(59 * MINUTE);
        assert_eq!(cache.get("cached_config"), CacheLookup::Hit("enabled=true".into()));

        clock.advance(2 * MINUTE);
        assert_eq!(cache.get("cached_config"), CacheLookup::Miss);
        assert_eq!(cache.hot_len(), 0);
    }

    #[test]
    fn test_warm_tier_survives_restart_and_backfills() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");
        {
            let (cache, _) = manager(EncryptedStore::open(&path, &KEY).unwrap());
            cache.put("cached_config", "version=3", HOUR).unwrap();
        }

        let (cache, clock) = manager(EncryptedStore::open(&path, &KEY).unwrap());
        assert_eq!(cache.hot_len(), 0);
        clock.advance(59 * MINUTE);
        assert_eq!(cache.get("cached_config"), CacheLookup::Hit("version=3".into()));
        assert_eq!(cache.hot_len(), 1);

        clock.advance(2 * MINUTE);
        assert_eq!(cache.get("cached_config"), CacheLookup::Miss);
        let reopened = EncryptedStore::open(&path, &KEY).unwrap();
        assert!(reopened.get("cache/cached_config").is_none());
        assert!(reopened.get("lkg/cached_config").is_some());
    }

    #[test]
    fn test_tampered_warm_entry_is_purged() {
        let mut store = EncryptedStore::new_memory(&KEY).unwrap();
        let mut entry = CacheEntry::new("k", "enabled=false", 1_000_000, HOUR.as_millis() as u64);
        entry.value = "enabled=true".into();
        store.set("cache/k", &serde_json::to_vec(&entry).unwrap());

        let (cache, _) = manager(store);
        assert_eq!(cache.get("k"), CacheLookup::Miss);
        assert!(cache.store.lock().get("cache/k").is_none());
    }

    #[test]
    fn test_last_known_good_outlives_ttl() {
        let (cache, clock) = manager(EncryptedStore::new_memory(&KEY).unwrap());
        cache.put("cached_config", "version=9", Duration::from_secs(60)).unwrap();
        clock.advance(24 * 60 * MINUTE);
        assert_eq!(cache.get("cached_config"), CacheLookup::Miss);
        assert_eq!(cache.last_known_good("cached_config").as_deref(), Some("version=9"));
        assert!(cache.last_known_good("other").is_none());
    }

    #[test]
    fn test_invalidate_keeps_lkg() {
        let (cache, _) = manager(EncryptedStore::new_memory(&KEY).unwrap());
        cache.put("k", "v", HOUR).unwrap();
        cache.invalidate("k").unwrap();
        assert_eq!(cache.get("k"), CacheLookup::Miss);
        assert_eq!(cache.last_known_good("k").as_deref(), Some("v"));
    }

    #[test]
    fn test_zeroized_hot_tier_falls_back_to_warm() {
        let memory = memory();
        let clock = Arc::new(ManualClock::new(5_000));
        let cache = CacheManager::new(memory.clone(), EncryptedStore::new_memory(&KEY).unwrap(), clock);
        cache.put("k", "payload", HOUR).unwrap();
        memory.zeroize_all();
        assert_eq!(cache.get("k"), CacheLookup::Hit("payload".into()));
    }

    #[test]
    fn test_preferences() {
        let (cache, _) = manager(EncryptedStore::new_memory(&KEY).unwrap());
        assert!(cache.preference("ignored_version").is_none());
        cache.set_preference("ignored_version", "4").unwrap();
        assert_eq!(cache.preference("ignored_version").as_deref(), Some("4"));
    }
}
