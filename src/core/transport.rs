//! HTTP transport abstraction over the upstream imagery API

use std::future::Future;
use std::time::Duration;
use tracing::trace;

use crate::core::errors::{FetchError, Result};

/// User agent sent with every upstream request
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Raw upstream response
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// GET transport used by the fetch client.
///
/// Non-2xx statuses are returned as responses, not errors; only failures to
/// obtain a response at all (timeout, connection) are errors.
pub trait ImageryTransport: Send + Sync {
    fn get(
        &self,
        url: &str,
        query: &[(&'static str, String)],
    ) -> impl Future<Output = Result<TransportResponse>> + Send;
}

/// Transport backed by a pooled `reqwest::Client`
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Create a transport with the given per-request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self { client })
    }
}

impl ImageryTransport for ReqwestTransport {
    async fn get(&self, url: &str, query: &[(&'static str, String)]) -> Result<TransportResponse> {
        trace!("GET {}", url);

        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        Ok(TransportResponse {
            status,
            body: body.to_vec(),
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::TransientFetchFailure {
            message: err.to_string(),
        }
    }
}
