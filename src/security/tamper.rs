//! Runtime tamper checks.
//!
//! Every check is a [`TamperCheck`]. The built-in battery reads the host
//! through an [`EnvironmentProbe`]; hosts can inject extra checks.

use std::sync::Arc;

use rand::Rng;

use crate::platform::EnvironmentProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TamperError {
    #[error("Violation detected by {0}")]
    ViolationDetected(&'static str),
    #[error("Check {0} could not complete")]
    CheckFailed(&'static str),
}

pub trait TamperCheck: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self) -> Result<(), TamperError>;
}

const STACK_MARKERS: [&str; 5] = ["frida", "gum_", "xposed", "substrate", "cydia"];
const PRELOAD_VARS: [&str; 2] = ["LD_PRELOAD", "DYLD_INSERT_LIBRARIES"];
const INSTRUMENTATION_MODULES: [&str; 6] =
    ["frida-agent", "libfrida", "frida-gadget", "libgadget", "substrate", "xposed"];
const EMULATOR_ARTEFACTS: [&str; 7] = [
    "/dev/qemu_pipe",
    "/dev/socket/qemud",
    "/dev/socket/genyd",
    "/dev/socket/baseband_genyd",
    "/system/bin/qemu-props",
    "/system/lib/libc_malloc_debug_qemu.so",
    "/sys/qemu_trace",
];

pub struct DebuggerCheck(Arc<dyn EnvironmentProbe>);

impl TamperCheck for DebuggerCheck {
    fn name(&self) -> &'static str {
        "debugger"
    }

    fn check(&self) -> Result<(), TamperError> {
        match self.0.tracer_pid() {
            Some(_) => Err(TamperError::ViolationDetected(self.name())),
            None => Ok(()),
        }
    }
}

pub struct CallStackCheck(Arc<dyn EnvironmentProbe>);

impl TamperCheck for CallStackCheck {
    fn name(&self) -> &'static str {
        "call-stack"
    }

    fn check(&self) -> Result<(), TamperError> {
        let preloaded = PRELOAD_VARS
            .iter()
            .any(|var| self.0.env_var(var).is_some_and(|v| !v.trim().is_empty()));
        let symbols = self.0.backtrace_symbols().to_lowercase();
        if preloaded || STACK_MARKERS.iter().any(|m| symbols.contains(m)) {
            return Err(TamperError::ViolationDetected(self.name()));
        }
        Ok(())
    }
}

pub struct InstrumentationCheck(Arc<dyn EnvironmentProbe>);

impl TamperCheck for InstrumentationCheck {
    fn name(&self) -> &'static str {
        "instrumentation"
    }

    fn check(&self) -> Result<(), TamperError> {
        let hooked = self.0.mapped_modules().iter().any(|module| {
            let module = module.to_lowercase();
            INSTRUMENTATION_MODULES.iter().any(|m| module.contains(m))
        });
        if hooked {
            return Err(TamperError::ViolationDetected(self.name()));
        }
        Ok(())
    }
}

pub struct EmulatorCheck(Arc<dyn EnvironmentProbe>);

impl TamperCheck for EmulatorCheck {
    fn name(&self) -> &'static str {
        "emulator"
    }

    fn check(&self) -> Result<(), TamperError> {
        if EMULATOR_ARTEFACTS.iter().any(|p| self.0.path_exists(p)) {
            return Err(TamperError::ViolationDetected(self.name()));
        }
        Ok(())
    }
}

pub struct TamperDetectionEngine {
    builtins: Vec<Box<dyn TamperCheck>>,
    extensions: Vec<Box<dyn TamperCheck>>,
}

impl TamperDetectionEngine {
    pub fn new(probe: Arc<dyn EnvironmentProbe>) -> Self {
        let builtins: Vec<Box<dyn TamperCheck>> = vec![
            Box::new(DebuggerCheck(Arc::clone(&probe))),
            Box::new(CallStackCheck(Arc::clone(&probe))),
            Box::new(InstrumentationCheck(Arc::clone(&probe))),
            Box::new(EmulatorCheck(probe)),
        ];
        Self { builtins, extensions: Vec::new() }
    }

    pub fn with_extension(mut self, check: Box<dyn TamperCheck>) -> Self {
        self.extensions.push(check);
        self
    }

    pub fn check_count(&self) -> usize {
        self.builtins.len() + self.extensions.len()
    }

    /// Runs one randomly chosen built-in check.
    pub fn quick_check(&self) -> bool {
        let index = rand::thread_rng().gen_range(0..self.builtins.len());
        run(self.builtins[index].as_ref())
    }

    /// Runs every check, stopping at the first failure.
    pub fn deep_check(&self) -> bool {
        self.builtins
            .iter()
            .chain(self.extensions.iter())
            .all(|check| run(check.as_ref()))
    }
}

fn run(check: &dyn TamperCheck) -> bool {
    match check.check() {
        Ok(()) => true,
        Err(e) => {
            log::debug!("Tamper check failed: {}", e);
            false
        }
    }
}
