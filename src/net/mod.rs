//! Outbound HTTP plumbing.
//!
//! Everything network-facing goes through the [`Transport`] trait so the
//! resolver, the prober and the decoy generator can be driven by a scripted
//! transport in tests. [`BoundedTransport`] caps concurrent requests.

pub mod decoy;
pub mod headers;
#[cfg(feature = "http")]
pub mod http;
pub mod pinning;
pub mod prober;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

pub use decoy::DecoyTrafficGenerator;
pub use headers::RequestSigner;
pub use prober::{Endpoint, EndpointLatencyProber, EndpointTier};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    #[error("Transient network error: {0}")]
    Transient(String),
    #[error("Unexpected HTTP status {0}")]
    Status(u16),
    #[error("Request timed out")]
    Timeout,
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Request could not be signed")]
    Signing,
    #[error("Transport shut down")]
    Closed,
    #[error(transparent)]
    Pinning(#[from] pinning::PinError),
}

impl NetError {
    /// Whether retrying the same endpoint may help.
    pub fn is_transient(&self) -> bool {
        match self {
            NetError::Transient(_) | NetError::Timeout => true,
            NetError::Status(code) => *code >= 500 || *code == 429,
            NetError::InvalidUrl(_) | NetError::Signing | NetError::Closed | NetError::Pinning(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self { url: url.into(), method: Method::Get, headers: Vec::new(), timeout }
    }

    pub fn head(url: impl Into<String>, timeout: Duration) -> Self {
        Self { url: url.into(), method: Method::Head, headers: Vec::new(), timeout }
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 2xx and 3xx both count as "the endpoint answered".
    pub fn is_reachable(&self) -> bool {
        (200..400).contains(&self.status)
    }

    /// Turns a non-2xx response into [`NetError::Status`].
    pub fn into_success(self) -> Result<Self, NetError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(NetError::Status(self.status))
        }
    }
}

/// A single HTTP exchange. Non-2xx statuses are returned, not raised.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetError>;
}

/// Limits how many requests are in flight across every user of the wrapped
/// transport.
pub struct BoundedTransport {
    inner: Arc<dyn Transport>,
    permits: Arc<Semaphore>,
}

impl BoundedTransport {
    pub fn new(inner: Arc<dyn Transport>, permits: Arc<Semaphore>) -> Self {
        Self { inner, permits }
    }
}

#[async_trait]
impl Transport for BoundedTransport {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetError> {
        let _permit = self.permits.acquire().await.map_err(|_| NetError::Closed)?;
        match tokio::time::timeout(request.timeout, self.inner.fetch(request)).await {
            Ok(result) => result,
            Err(_) => Err(NetError::Timeout),
        }
    }
}

/// Host part of an absolute URL, without port or credentials.
pub fn host_of(url: &str) -> Option<&str> {
    let rest = url.split_once("://").map(|(_, r)| r)?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit('@').next()?;
    let host = host_port.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}
