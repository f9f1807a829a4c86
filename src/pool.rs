//! Worker pool for network work.
//!
//! A private multi-threaded tokio runtime plus a semaphore that bounds how
//! many outbound requests are in flight. Blocking callers hand futures over
//! with [`WorkerPool::block_on_timeout`].

use std::future::Future;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Semaphore;

use crate::config::PoolConfig;
use crate::net::{BoundedTransport, Transport};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Failed to start worker runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

pub struct WorkerPool {
    runtime: Option<Runtime>,
    handle: Handle,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(config: &PoolConfig) -> Result<Self, PoolError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("veil-worker")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Some(runtime),
            handle,
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wraps `transport` so it shares this pool's request limit.
    pub fn bound(&self, transport: Arc<dyn Transport>) -> Arc<dyn Transport> {
        Arc::new(BoundedTransport::new(transport, Arc::clone(&self.permits)))
    }

    /// Runs `future` on the pool and waits at most `timeout` for it.
    /// `None` on timeout; the future is cancelled.
    ///
    /// The future runs on the pool's own runtime, so this never deadlocks,
    /// but the calling thread is blocked throughout. Called from inside
    /// another runtime it stalls that runtime's worker for up to `timeout`
    /// (all of a `current_thread` runtime). Async callers should use
    /// [`handle`](Self::handle) and await instead.
    pub fn block_on_timeout<F>(&self, future: F, timeout: Duration) -> Option<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        self.handle.spawn(async move {
            if let Ok(output) = tokio::time::timeout(timeout, future).await {
                let _ = tx.send(output);
            }
        });
        rx.recv().ok()
    }

    pub fn shutdown(mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::FetchRequest;
    use crate::testing::FakeTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(limit: usize) -> WorkerPool {
        WorkerPool::new(&PoolConfig { worker_threads: 2, max_concurrent_requests: limit }).unwrap()
    }

    #[test]
    fn test_block_on_timeout() {
        let pool = pool(4);
        assert_eq!(pool.block_on_timeout(async { 41 + 1 }, Duration::from_secs(1)), Some(42));
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            1
        };
        assert_eq!(pool.block_on_timeout(slow, Duration::from_millis(20)), None);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_block_on_timeout_inside_current_thread_runtime() {
        let pool = pool(1);
        let work = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            7
        };
        assert_eq!(pool.block_on_timeout(work, Duration::from_secs(2)), Some(7));
        tokio::task::spawn_blocking(move || pool.shutdown()).await.unwrap();
    }

    #[test]
    fn test_bound_limits_concurrency() {
        let pool = pool(2);
        let fake = Arc::new(FakeTransport::new());
        for i in 0..6 {
            let url = format!("https://h{}.example.com", i);
            fake.respond(&url, 200, b"");
            fake.delay(&url, Duration::from_millis(30));
        }
        let transport = pool.bound(fake.clone());
        let peak = Arc::new(AtomicUsize::new(0));

        let probe_peak = peak.clone();
        let permits = Arc::clone(&pool.permits);
        let work = async move {
            let watcher = tokio::spawn(async move {
                for _ in 0..40 {
                    let in_flight = 2 - permits.available_permits();
                    probe_peak.fetch_max(in_flight, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            });
            let requests: Vec<FetchRequest> = (0..6)
                .map(|i| FetchRequest::get(format!("https://h{}.example.com", i), Duration::from_secs(1)))
                .collect();
            let results = futures::future::join_all(requests.iter().map(|r| transport.fetch(r))).await;
            watcher.abort();
            results.iter().all(|r| r.is_ok())
        };
        assert_eq!(pool.block_on_timeout(work, Duration::from_secs(5)), Some(true));
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(fake.total(), 6);
    }
}
