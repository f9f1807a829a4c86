//! Security state machine.
//!
//! # States
//! - **Nominal(level, streak)**: every failed quick check raises both; a
//!   pass resets the streak. The level never goes down on its own.
//! - **Compromised**: entered once the streak reaches the threshold or a deep
//!   check fails. One-way: the watchdog is cancelled, protected memory is
//!   burned and the violation callback runs exactly once.
//!
//! While compromised every check reports failure without touching the probes.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::tamper::TamperDetectionEngine;
use crate::audit::EventRing;
use crate::memory::ProtectedMemoryStore;
use crate::platform::Clock;
use crate::watchdog::{Watchdog, WatchdogError, WatchdogTarget};

/// Decides whether sensitive work may proceed.
pub trait SecurityGate: Send + Sync {
    fn permits(&self) -> bool;
}

pub type ViolationCallback = Box<dyn FnOnce(&SecurityState) + Send>;

/// Point-in-time copy of the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityState {
    pub level: u32,
    pub compromised: bool,
    pub failure_streak: u32,
    pub event_log: Vec<String>,
}

pub struct SecurityStateMachine {
    engine: TamperDetectionEngine,
    memory: Arc<ProtectedMemoryStore>,
    clock: Arc<dyn Clock>,
    threshold: u32,
    level: AtomicU32,
    streak: AtomicU32,
    compromised: AtomicBool,
    events: Mutex<EventRing>,
    on_violation: Mutex<Option<ViolationCallback>>,
    watchdog: Mutex<Option<Watchdog>>,
}

impl SecurityStateMachine {
    pub fn new(
        engine: TamperDetectionEngine,
        memory: Arc<ProtectedMemoryStore>,
        clock: Arc<dyn Clock>,
        threshold: u32,
    ) -> Self {
        Self {
            engine,
            memory,
            clock,
            threshold: threshold.max(1),
            level: AtomicU32::new(0),
            streak: AtomicU32::new(0),
            compromised: AtomicBool::new(false),
            events: Mutex::new(EventRing::new()),
            on_violation: Mutex::new(None),
            watchdog: Mutex::new(None),
        }
    }

    /// Runs one quick check. Returns whether the process is still trusted.
    pub fn check(&self) -> bool {
        if self.is_compromised() {
            return false;
        }
        let passed = self.engine.quick_check();
        self.record("quick_check", passed);
        if passed {
            self.streak.store(0, Ordering::SeqCst);
            return !self.is_compromised();
        }

        self.level.fetch_add(1, Ordering::SeqCst);
        let streak = self.streak.fetch_add(1, Ordering::SeqCst) + 1;
        log::warn!("Security check failed ({} in a row)", streak);
        if streak >= self.threshold {
            self.compromise("failure streak");
        }
        false
    }

    /// Runs the full battery. Any failure compromises immediately.
    pub fn deep_check(&self) -> bool {
        if self.is_compromised() {
            return false;
        }
        let passed = self.engine.deep_check();
        self.record("deep_check", passed);
        if !passed {
            self.level.fetch_add(1, Ordering::SeqCst);
            self.compromise("deep check");
        }
        passed && !self.is_compromised()
    }

    pub fn is_compromised(&self) -> bool {
        self.compromised.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SecurityState {
        SecurityState {
            level: self.level.load(Ordering::SeqCst),
            compromised: self.is_compromised(),
            failure_streak: self.streak.load(Ordering::SeqCst),
            event_log: self.events.lock().rendered(),
        }
    }

    /// Clears level and streak. Has no effect once compromised.
    pub fn reset(&self) -> bool {
        if self.is_compromised() {
            return false;
        }
        self.level.store(0, Ordering::SeqCst);
        self.streak.store(0, Ordering::SeqCst);
        self.record("reset", true);
        true
    }

    /// Registers the callback run on compromise. If the process is already
    /// compromised it runs immediately.
    pub fn on_violation(&self, callback: ViolationCallback) {
        if self.is_compromised() {
            callback(&self.state());
            return;
        }
        *self.on_violation.lock() = Some(callback);
        // Lost the race with a concurrent compromise: fire here instead.
        if self.is_compromised() {
            let callback = self.on_violation.lock().take();
            if let Some(callback) = callback {
                callback(&self.state());
            }
        }
    }

    /// Starts the periodic checker.
    pub fn start_watchdog(self: &Arc<Self>, base: Duration, jitter: Duration) -> Result<(), WatchdogError> {
        if self.is_compromised() {
            return Ok(());
        }
        let dog = Watchdog::spawn(Arc::downgrade(self), base, jitter)?;
        if let Some(previous) = self.watchdog.lock().replace(dog) {
            previous.cancel();
        }
        Ok(())
    }

    pub fn stop_watchdog(&self) {
        let dog = self.watchdog.lock().take();
        if let Some(dog) = dog {
            dog.stop();
        }
    }

    fn record(&self, action: &str, passed: bool) {
        self.events.lock().log(self.clock.now_millis(), action, passed);
    }

    fn compromise(&self, reason: &str) {
        if self
            .compromised
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        log::error!("Security state compromised");
        log::debug!("Compromise trigger: {}", reason);
        self.record("compromised", false);

        if let Some(dog) = self.watchdog.lock().take() {
            dog.cancel();
        }
        self.memory.zeroize_all();

        let callback = self.on_violation.lock().take();
        if let Some(callback) = callback {
            callback(&self.state());
        }
    }
}

impl SecurityGate for SecurityStateMachine {
    fn permits(&self) -> bool {
        !self.is_compromised()
    }
}

impl WatchdogTarget for SecurityStateMachine {
    fn on_tick(&self) -> bool {
        self.check();
        !self.is_compromised()
    }
}
