use super::EnvironmentProbe;

use std::backtrace::Backtrace;
use std::fs;
use std::path::Path;

/// Probe backed by procfs and well-known host files.
///
/// On platforms without procfs the process-level answers degrade to
/// "nothing detected".
#[derive(Debug, Default, Clone, Copy)]
pub struct PcPlatform;

impl PcPlatform {
    pub fn new() -> Self {
        Self
    }

    fn read_to_string(path: &str) -> Option<String> {
        fs::read_to_string(path).ok()
    }

    fn status_field(name: &str) -> Option<String> {
        let status = Self::read_to_string("/proc/self/status")?;
        status
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .map(|rest| rest.trim_start_matches(':').trim().to_string())
    }
}

impl EnvironmentProbe for PcPlatform {
    fn tracer_pid(&self) -> Option<u32> {
        let pid = Self::status_field("TracerPid")?.parse::<u32>().ok()?;
        (pid != 0).then_some(pid)
    }

    fn mapped_modules(&self) -> Vec<String> {
        let Some(maps) = Self::read_to_string("/proc/self/maps") else {
            return Vec::new();
        };
        let mut modules: Vec<String> = maps
            .lines()
            .filter_map(|line| line.split_whitespace().nth(5))
            .filter(|path| path.starts_with('/'))
            .map(str::to_string)
            .collect();
        modules.sort();
        modules.dedup();
        modules
    }

    fn env_var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn path_exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn backtrace_symbols(&self) -> String {
        Backtrace::force_capture().to_string()
    }

    fn available_memory(&self) -> Option<u64> {
        let meminfo = Self::read_to_string("/proc/meminfo")?;
        let kib = meminfo
            .lines()
            .find_map(|line| line.strip_prefix("MemAvailable:"))?
            .trim()
            .trim_end_matches("kB")
            .trim()
            .parse::<u64>()
            .ok()?;
        Some(kib.saturating_mul(1024))
    }

    fn host_identifiers(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
            if let Some(id) = Self::read_to_string(path) {
                ids.push(id.trim().to_string());
                break;
            }
        }
        if let Some(host) = Self::read_to_string("/etc/hostname") {
            ids.push(host.trim().to_string());
        }
        ids.push(std::env::consts::OS.to_string());
        ids.push(std::env::consts::ARCH.to_string());
        ids
    }
}
