//! Shared fakes for unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::crypto::{KeyDerivationService, StaticFingerprint};
use crate::net::{FetchRequest, FetchResponse, NetError, Transport};
use crate::platform::EnvironmentProbe;

pub(crate) const TEST_FLEET_ID: &[u8] = b"veilconf-test-fleet";

/// Key derivation bound to a fixed identity, shared by sealing helpers and
/// the code under test.
pub(crate) fn test_kdf() -> Arc<KeyDerivationService> {
    Arc::new(KeyDerivationService::new(&StaticFingerprint::new(TEST_FLEET_ID.to_vec()), 0))
}

/// Environment with every field set explicitly.
#[derive(Debug, Clone)]
pub(crate) struct FakeProbe {
    pub(crate) tracer_pid: Option<u32>,
    pub(crate) modules: Vec<String>,
    pub(crate) env: HashMap<String, String>,
    pub(crate) paths: Vec<String>,
    pub(crate) backtrace: String,
    pub(crate) available_memory: Option<u64>,
    pub(crate) host_ids: Vec<String>,
}

impl FakeProbe {
    /// An untampered host.
    pub(crate) fn clean() -> Self {
        Self {
            tracer_pid: None,
            modules: vec![
                "/usr/lib/x86_64-linux-gnu/libc.so.6".to_string(),
                "/usr/lib/x86_64-linux-gnu/libm.so.6".to_string(),
            ],
            env: HashMap::new(),
            paths: Vec::new(),
            backtrace: "veilconf::security::tamper::tests\nstd::rt::lang_start".to_string(),
            available_memory: Some(8 * 1024 * 1024 * 1024),
            host_ids: vec!["machine-0451".to_string(), "build-host".to_string(), "linux".to_string()],
        }
    }

    /// Every built-in tamper check trips on this host.
    pub(crate) fn hostile() -> Self {
        let mut env = HashMap::new();
        env.insert("LD_PRELOAD".to_string(), "/data/local/tmp/libhook.so".to_string());
        Self {
            tracer_pid: Some(4242),
            modules: vec!["/data/local/tmp/frida-agent-64.so".to_string()],
            env,
            paths: vec!["/dev/qemu_pipe".to_string()],
            backtrace: "0: frida_agent_main\n1: gum_invocation_listener".to_string(),
            ..Self::clean()
        }
    }
}

impl EnvironmentProbe for FakeProbe {
    fn tracer_pid(&self) -> Option<u32> {
        self.tracer_pid
    }

    fn mapped_modules(&self) -> Vec<String> {
        self.modules.clone()
    }

    fn env_var(&self, name: &str) -> Option<String> {
        self.env.get(name).cloned()
    }

    fn path_exists(&self, path: &str) -> bool {
        self.paths.iter().any(|p| p == path)
    }

    fn backtrace_symbols(&self) -> String {
        self.backtrace.clone()
    }

    fn available_memory(&self) -> Option<u64> {
        self.available_memory
    }

    fn host_identifiers(&self) -> Vec<String> {
        self.host_ids.clone()
    }
}

/// Scripted transport. Each URL answers with its configured response every
/// time; unknown URLs fail as unreachable.
#[derive(Default)]
pub(crate) struct FakeTransport {
    responses: Mutex<HashMap<String, Result<FetchResponse, NetError>>>,
    delays: Mutex<HashMap<String, Duration>>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn respond(&self, url: &str, status: u16, body: &[u8]) {
        self.responses
            .lock()
            .insert(url.to_string(), Ok(FetchResponse { status, body: body.to_vec() }));
    }

    pub(crate) fn delay(&self, url: &str, delay: Duration) {
        self.delays.lock().insert(url.to_string(), delay);
    }

    pub(crate) fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }

    pub(crate) fn urls(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.url.clone()).collect()
    }

    pub(crate) fn count_for(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.url == url).count()
    }

    pub(crate) fn total(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetError> {
        self.requests.lock().push(request.clone());
        let delay = self.delays.lock().get(&request.url).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.responses.lock().get(&request.url).cloned();
        scripted.unwrap_or_else(|| Err(NetError::Transient(format!("no route to {}", request.url))))
    }
}
