//! Endpoint latency probing.
//!
//! A HEAD request per endpoint, all in flight at once. Only endpoints that
//! answer with 2xx or 3xx inside the timeout get a latency; the rest are left
//! out of the ranking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::RwLock;

use super::{FetchRequest, RequestSigner, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointTier {
    Bootstrap,
    Real,
    Decoy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub tier: EndpointTier,
    pub measured_latency_ms: Option<u64>,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, tier: EndpointTier) -> Self {
        Self { url: url.into(), tier, measured_latency_ms: None }
    }
}

pub struct EndpointLatencyProber {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    ranking: RwLock<Option<HashMap<String, u64>>>,
}

impl EndpointLatencyProber {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout, ranking: RwLock::new(None) }
    }

    /// Probes every endpoint concurrently and caches the result. Returns the
    /// responders sorted by latency.
    pub async fn probe_all(&self, endpoints: &[Endpoint]) -> Vec<Endpoint> {
        let probes = endpoints.iter().map(|endpoint| self.probe_one(endpoint));
        let mut measured: Vec<Endpoint> = join_all(probes).await.into_iter().flatten().collect();
        measured.sort_by_key(|e| e.measured_latency_ms);

        let table = measured
            .iter()
            .filter_map(|e| e.measured_latency_ms.map(|ms| (e.url.clone(), ms)))
            .collect::<HashMap<_, _>>();
        log::debug!("Probed {} endpoints, {} responded", endpoints.len(), table.len());
        *self.ranking.write() = Some(table);
        measured
    }

    async fn probe_one(&self, endpoint: &Endpoint) -> Option<Endpoint> {
        let request = FetchRequest::head(endpoint.url.clone(), self.timeout)
            .with_headers(vec![("User-Agent".to_string(), RequestSigner::user_agent().to_string())]);
        let started = Instant::now();
        let response = tokio::time::timeout(self.timeout, self.transport.fetch(&request))
            .await
            .ok()?
            .ok()?;
        if !response.is_reachable() {
            return None;
        }
        Some(Endpoint {
            measured_latency_ms: Some(started.elapsed().as_millis() as u64),
            ..endpoint.clone()
        })
    }

    pub fn has_ranking(&self) -> bool {
        self.ranking.read().is_some()
    }

    /// Orders `endpoints` by cached latency, unranked ones last in their
    /// original order. `None` until a probe has completed.
    pub fn rank(&self, endpoints: &[Endpoint]) -> Option<Vec<Endpoint>> {
        let guard = self.ranking.read();
        let table = guard.as_ref()?;
        let mut ranked: Vec<Endpoint> = endpoints
            .iter()
            .map(|e| Endpoint { measured_latency_ms: table.get(&e.url).copied(), ..e.clone() })
            .collect();
        ranked.sort_by_key(|e| e.measured_latency_ms.unwrap_or(u64::MAX));
        Some(ranked)
    }

    /// Re-probes `endpoints` every `interval` until aborted or the prober is
    /// dropped.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        runtime: &tokio::runtime::Handle,
        endpoints: Vec<Endpoint>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let prober = Arc::downgrade(self);
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(prober) = prober.upgrade() else {
                    break;
                };
                prober.probe_all(&endpoints).await;
            }
        })
    }
}
