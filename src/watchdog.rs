//! Jittered background checker.
//!
//! A dedicated thread wakes at `base ± jitter` and ticks its target. The
//! thread holds only a `Weak` reference, so it never keeps the target alive,
//! and exits once the target is gone, asks to stop, or the watchdog is
//! cancelled. On Linux and Android the thread lowers its own scheduling
//! priority before the first tick.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::Rng;

/// Added to the watchdog thread's nice value.
const NICE_INCREMENT: i32 = 10;
const NICE_MAX: i32 = 19;

#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    #[error("Watchdog thread could not be started: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

pub trait WatchdogTarget: Send + Sync + 'static {
    /// One periodic check. Returning `false` stops the watchdog.
    fn on_tick(&self) -> bool;
}

pub struct Watchdog {
    cancelled: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn<T: WatchdogTarget>(
        target: Weak<T>,
        base: Duration,
        jitter: Duration,
    ) -> Result<Self, WatchdogError> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let ticks = Arc::new(AtomicU64::new(0));
        let thread = {
            let cancelled = Arc::clone(&cancelled);
            let ticks = Arc::clone(&ticks);
            thread::Builder::new()
                .name("veil-watchdog".into())
                .spawn(move || {
                    lower_priority();
                    loop {
                        thread::park_timeout(next_interval(base, jitter));
                        if cancelled.load(Ordering::Acquire) {
                            break;
                        }
                        let Some(target) = target.upgrade() else {
                            break;
                        };
                        ticks.fetch_add(1, Ordering::Relaxed);
                        if !target.on_tick() {
                            break;
                        }
                    }
                    log::debug!("Watchdog stopped");
                })?
        };
        Ok(Self { cancelled, ticks, thread: Some(thread) })
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signals the thread to stop without waiting for it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(thread) = &self.thread {
            thread.thread().unpark();
        }
    }

    /// Cancels and waits for the thread, unless called from the thread
    /// itself.
    pub fn stop(mut self) {
        self.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn lower_priority() {
    // With `who == 0` Linux applies the nice value to the calling thread only.
    let changed = unsafe {
        let current = libc::getpriority(libc::PRIO_PROCESS, 0);
        libc::setpriority(libc::PRIO_PROCESS, 0, (current + NICE_INCREMENT).min(NICE_MAX))
    };
    if changed != 0 {
        log::debug!("Watchdog priority unchanged: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn lower_priority() {}

fn next_interval(base: Duration, jitter: Duration) -> Duration {
    let base = base.as_millis() as u64;
    let jitter = jitter.as_millis() as u64;
    let low = base.saturating_sub(jitter).max(1);
    let high = base.saturating_add(jitter).max(low);
    Duration::from_millis(rand::thread_rng().gen_range(low..=high))
}
