//! reqwest-backed [`Transport`].
//!
//! With pins configured the client runs on a preconfigured rustls config
//! whose verifier enforces them; otherwise it uses reqwest's own rustls setup.

use async_trait::async_trait;
use reqwest::Client;

use super::pinning::{PinnedCertVerifier, SpkiPins};
use super::{FetchRequest, FetchResponse, Method, NetError, Transport};
use crate::config::TlsConfig;

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(tls: &TlsConfig) -> Result<Self, NetError> {
        let pins = SpkiPins::from_hex(&tls.pinned_spki_sha256)?;
        let builder = Client::builder().redirect(reqwest::redirect::Policy::limited(3));
        let builder = if pins.is_empty() {
            builder.use_rustls_tls()
        } else {
            log::debug!("Certificate pinning enabled");
            builder.use_preconfigured_tls(PinnedCertVerifier::new(pins).client_config())
        };
        let client = builder.build().map_err(|e| NetError::Transient(e.to_string()))?;
        Ok(Self { client })
    }
}

fn classify(err: reqwest::Error) -> NetError {
    if err.is_timeout() {
        NetError::Timeout
    } else if err.is_builder() {
        NetError::InvalidUrl(err.to_string())
    } else {
        NetError::Transient(err.to_string())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Head => self.client.head(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.timeout(request.timeout).send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let body = match request.method {
            Method::Head => Vec::new(),
            Method::Get => response.bytes().await.map_err(classify)?.to_vec(),
        };
        Ok(FetchResponse { status, body })
    }
}
