//! Per-endpoint retry with jittered linear backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::ResolverConfig;
use crate::net::NetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ResolverConfig) -> Self {
        Self {
            attempts: config.attempts_per_endpoint.max(1),
            backoff_min: Duration::from_millis(config.backoff_min_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms.max(config.backoff_min_ms)),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based):
    /// `random(min..=max) * attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let min = self.backoff_min.as_millis() as u64;
        let max = (self.backoff_max.as_millis() as u64).max(min);
        let base = rand::thread_rng().gen_range(min..=max);
        Duration::from_millis(base.saturating_mul(u64::from(attempt)))
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, NetError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, NetError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    log::debug!("Attempt {} failed ({}), backing off", attempt, e);
                    tokio::time::sleep(self.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
