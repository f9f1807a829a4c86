//! Platform access.
//!
//! Everything the library learns about the host goes through two seams:
//! - [`Clock`]: wall-clock milliseconds, swappable for a [`ManualClock`].
//! - [`EnvironmentProbe`]: process and host introspection used by the tamper
//!   checks, the memory store and the device fingerprint.
//!
//! [`pc::PcPlatform`] is the procfs-backed default.

pub mod pc;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub use pc::PcPlatform;

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self { now: AtomicU64::new(start_millis) }
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Read-only view of the running process and its host.
///
/// Implementations must be cheap enough to call from the quick tamper check
/// path and must never panic; an unreadable source reports "nothing found".
pub trait EnvironmentProbe: Send + Sync {
    /// PID of an attached tracer, `None` when untraced or unknown.
    fn tracer_pid(&self) -> Option<u32>;

    /// Paths or names of shared objects mapped into the process.
    fn mapped_modules(&self) -> Vec<String>;

    fn env_var(&self, name: &str) -> Option<String>;

    fn path_exists(&self, path: &str) -> bool;

    /// Symbolized text of the current call stack.
    fn backtrace_symbols(&self) -> String;

    /// Bytes of memory the OS reports as available, if known.
    fn available_memory(&self) -> Option<u64>;

    /// Stable host identifiers (machine id, hostname, os, arch, ...).
    fn host_identifiers(&self) -> Vec<String>;
}
