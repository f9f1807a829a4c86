//! Decoy traffic.
//!
//! Each real request is surrounded by `ratio` GETs to innocuous URLs, started
//! after a random delay so the real request does not stand out by timing.
//! Decoys share the real requests' header shape and their outcome is ignored.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;

use super::{FetchRequest, RequestSigner, Transport};
use crate::config::DecoyConfig;

pub struct DecoyTrafficGenerator {
    transport: Arc<dyn Transport>,
    signer: Arc<RequestSigner>,
    urls: Vec<String>,
    config: DecoyConfig,
    issued: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
}

impl DecoyTrafficGenerator {
    pub fn new(
        transport: Arc<dyn Transport>,
        signer: Arc<RequestSigner>,
        urls: Vec<String>,
        config: DecoyConfig,
    ) -> Self {
        Self {
            transport,
            signer,
            urls,
            config,
            issued: Arc::new(AtomicU64::new(0)),
            completed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Decoys scheduled so far.
    pub fn decoys_issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Decoys that reached the transport and returned, whatever the outcome.
    pub fn decoys_completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Schedules decoys on the current runtime, then awaits `real`.
    pub async fn shield<F, T>(&self, real: F) -> T
    where
        F: Future<Output = T>,
    {
        self.schedule_decoys();
        real.await
    }

    fn schedule_decoys(&self) {
        if self.urls.is_empty() || self.config.ratio == 0 {
            return;
        }
        let mut rng = rand::thread_rng();
        for _ in 0..self.config.ratio {
            let Some(url) = self.urls.choose(&mut rng).cloned() else {
                return;
            };
            let delay = Duration::from_millis(rng.gen_range(0..=self.config.max_start_delay_ms));
            let timeout = Duration::from_millis(self.config.timeout_ms);
            let transport = Arc::clone(&self.transport);
            let signer = Arc::clone(&self.signer);
            let completed = Arc::clone(&self.completed);
            self.issued.fetch_add(1, Ordering::Relaxed);

            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let headers = signer.headers_for(&url).unwrap_or_default();
                let request = FetchRequest::get(url, timeout).with_headers(headers);
                if let Err(e) = transport.fetch(&request).await {
                    log::trace!("Decoy request failed: {}", e);
                }
                completed.fetch_add(1, Ordering::Relaxed);
            });
        }
    }
}
