//! Protected memory regions.
//!
//! Secrets that must outlive a single call (the hot cache tier) are kept in
//! anonymous memory maps rather than on the heap. Maps are locked where the
//! OS allows it, so they stay out of swap.
//!
//! # Ownership
//! A [`MemoryHandle`] owns its region. The store only keeps `Weak`
//! references, so dropping the last handle reclaims the region, and
//! [`ProtectedMemoryStore::sweep`] forgets the dead entry later. Every
//! region is burned before its pages are unmapped.

pub mod burn;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use memmap2::MmapMut;
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use zeroize::Zeroizing;

use crate::config::MemoryConfig;
use crate::platform::EnvironmentProbe;
use burn::burn_slice;

const REGION_PAGE: usize = 4096;

const ANALYSIS_TOOLING: [&str; 5] = ["valgrind", "vgpreload", "heaptrack", "libasan", "memcheck"];

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Protected memory unavailable: {0}")]
    InitFailed(String),
    #[error("Failed to map region: {0}")]
    Map(#[from] std::io::Error),
}

struct RegionInner {
    map: MmapMut,
    used: usize,
}

struct Region {
    id: u64,
    tag: String,
    inner: Mutex<RegionInner>,
}

impl Region {
    fn burn(&self) {
        let mut inner = self.inner.lock();
        burn_slice(&mut inner.map[..]);
        inner.used = 0;
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        burn_slice(&mut inner.map[..]);
    }
}

/// Owning handle to one protected region.
#[derive(Clone)]
pub struct MemoryHandle {
    region: Arc<Region>,
}

impl MemoryHandle {
    pub fn id(&self) -> u64 {
        self.region.id
    }

    pub fn tag(&self) -> &str {
        &self.region.tag
    }
}

impl std::fmt::Debug for MemoryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MemoryHandle({}, {})", self.region.id, self.region.tag)
    }
}

fn map_region(len: usize) -> Result<MmapMut, MemoryError> {
    #[allow(unused_mut)]
    let mut map = MmapMut::map_anon(len.max(1))?;
    #[cfg(unix)]
    {
        if let Err(e) = map.lock() {
            log::debug!("mlock unavailable for {} byte region: {}", len, e);
        }
    }
    Ok(map)
}

fn region_capacity(len: usize) -> usize {
    len.max(1).div_ceil(REGION_PAGE) * REGION_PAGE
}

pub struct ProtectedMemoryStore {
    regions: Mutex<Vec<Weak<Region>>>,
    next_id: AtomicU64,
    noise_buffer_bytes: usize,
}

impl ProtectedMemoryStore {
    /// Refuses to start on a starved host or under memory analysis tooling.
    pub fn new(config: &MemoryConfig, probe: &dyn EnvironmentProbe) -> Result<Self, MemoryError> {
        if let Some(available) = probe.available_memory() {
            if available < config.min_available_bytes {
                return Err(MemoryError::InitFailed(format!(
                    "{} bytes available, {} required",
                    available, config.min_available_bytes
                )));
            }
        }

        let preload = probe.env_var("LD_PRELOAD").unwrap_or_default().to_lowercase();
        let tooling = probe
            .mapped_modules()
            .into_iter()
            .map(|m| m.to_lowercase())
            .chain(std::iter::once(preload))
            .any(|m| ANALYSIS_TOOLING.iter().any(|t| m.contains(t)));
        if tooling {
            return Err(MemoryError::InitFailed("memory analysis tooling present".into()));
        }

        Ok(Self {
            regions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            noise_buffer_bytes: config.noise_buffer_bytes,
        })
    }

    pub fn allocate(&self, tag: &str) -> Result<MemoryHandle, MemoryError> {
        let region = Arc::new(Region {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            tag: tag.to_string(),
            inner: Mutex::new(RegionInner { map: map_region(REGION_PAGE)?, used: 0 }),
        });
        self.regions.lock().push(Arc::downgrade(&region));
        Ok(MemoryHandle { region })
    }

    /// Replaces the region contents, growing the mapping when needed.
    pub fn write(&self, handle: &MemoryHandle, bytes: &[u8]) -> Result<(), MemoryError> {
        let mut inner = handle.region.inner.lock();
        if bytes.len() > inner.map.len() {
            let mut grown = map_region(region_capacity(bytes.len()))?;
            std::mem::swap(&mut inner.map, &mut grown);
            burn_slice(&mut grown[..]);
        }
        burn_slice(&mut inner.map[..]);
        inner.map[..bytes.len()].copy_from_slice(bytes);
        inner.used = bytes.len();
        Ok(())
    }

    pub fn read(&self, handle: &MemoryHandle) -> Zeroizing<Vec<u8>> {
        let inner = handle.region.inner.lock();
        Zeroizing::new(inner.map[..inner.used].to_vec())
    }

    pub fn clear(&self, handle: &MemoryHandle) {
        handle.region.burn();
    }

    /// Burns every live region. Handles stay valid but read back empty.
    pub fn zeroize_all(&self) {
        let regions = self.regions.lock();
        let mut burned = 0usize;
        for region in regions.iter().filter_map(Weak::upgrade) {
            region.burn();
            burned += 1;
        }
        log::info!("Zeroized {} protected regions", burned);
    }

    pub fn live_regions(&self) -> usize {
        self.regions.lock().iter().filter(|w| w.strong_count() > 0).count()
    }

    /// Forgets dead regions and churns a noise buffer. Returns how many
    /// references were pruned.
    pub fn sweep(&self) -> usize {
        let pruned = {
            let mut regions = self.regions.lock();
            let before = regions.len();
            regions.retain(|w| w.strong_count() > 0);
            before - regions.len()
        };

        if self.noise_buffer_bytes > 0 {
            match MmapMut::map_anon(self.noise_buffer_bytes) {
                Ok(mut noise) => {
                    OsRng.fill_bytes(&mut noise[..]);
                    burn_slice(&mut noise[..]);
                }
                Err(e) => log::debug!("Noise buffer allocation failed: {}", e),
            }
        }
        pruned
    }

    /// Runs [`sweep`](Self::sweep) every `interval` until the store is
    /// dropped or the task is aborted.
    pub fn spawn_noise_sweeper(
        self: &Arc<Self>,
        runtime: &tokio::runtime::Handle,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::downgrade(self);
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.sweep();
                    }
                    None => break,
                }
            }
        })
    }
}
