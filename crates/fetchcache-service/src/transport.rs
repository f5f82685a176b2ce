//! The boundary to whatever actually produces payloads.
//!
//! A [`Transport`] performs a single attempt of a request. It knows nothing about caching or
//! retries, both are layered on top of it by the [`FetchCoordinator`](crate::FetchCoordinator).
//! Dropping the returned future aborts the attempt.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;
use url::Url;

use crate::caching::CacheKey;
use crate::config::FetchConfig;
use crate::utils::futures::{m, measure};

/// The user agent sent by [`HttpTransport`].
pub const USER_AGENT: &str = concat!("fetchcache/", env!("CARGO_PKG_VERSION"));

/// A request for a single resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: Url,
    pub headers: BTreeMap<String, String>,
}

impl FetchRequest {
    /// Creates a plain `GET` request for `url`.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// The [`CacheKey`] derived from the canonical form of the URL.
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::from_url(&self.url)
    }
}

/// The outcome of an attempt that reached the other side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The status code, following HTTP semantics.
    pub status: u16,
    pub payload: Bytes,
}

impl Response {
    /// A successful response with status `200`.
    pub fn ok(payload: impl Into<Bytes>) -> Self {
        Self::with_status(200, payload)
    }

    pub fn with_status(status: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            status,
            payload: payload.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// An attempt that did not produce a [`Response`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The attempt did not complete in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The connection could not be established or was lost.
    #[error("connection failed: {0}")]
    Connection(String),
    /// The request is malformed and can never succeed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The response could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

/// Performs a single attempt of a [`FetchRequest`].
pub trait Transport: Send + Sync + 'static {
    fn perform<'a>(
        &'a self,
        request: &'a FetchRequest,
    ) -> BoxFuture<'a, Result<Response, TransportError>>;
}

/// A [`Transport`] backed by a closure, see [`from_fn`].
pub struct FnTransport<F> {
    f: F,
}

impl<F> fmt::Debug for FnTransport<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTransport").finish_non_exhaustive()
    }
}

/// Creates a [`Transport`] that calls `f` for every attempt.
pub fn from_fn<F, Fut>(f: F) -> FnTransport<F>
where
    F: Fn(FetchRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, TransportError>> + Send + 'static,
{
    FnTransport { f }
}

impl<F, Fut> Transport for FnTransport<F>
where
    F: Fn(FetchRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, TransportError>> + Send + 'static,
{
    fn perform<'a>(
        &'a self,
        request: &'a FetchRequest,
    ) -> BoxFuture<'a, Result<Response, TransportError>> {
        Box::pin((self.f)(request.clone()))
    }
}

/// A [`Transport`] performing HTTP `GET` requests.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &FetchConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .gzip(true)
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            timeout: config.timeout,
        })
    }

    async fn get(&self, request: &FetchRequest) -> Result<Response, TransportError> {
        let mut builder = self.client.get(request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status().as_u16();
        tracing::trace!("Received status {} from `{}`", status, request.url);

        let payload = response.bytes().await.map_err(|e| self.map_error(e))?;
        Ok(Response { status, payload })
    }

    fn map_error(&self, err: reqwest::Error) -> TransportError {
        let message = error_message(&err);
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if err.is_builder() || err.is_redirect() {
            TransportError::InvalidRequest(message)
        } else if err.is_decode() {
            TransportError::Decode(message)
        } else {
            TransportError::Connection(message)
        }
    }
}

impl Transport for HttpTransport {
    fn perform<'a>(
        &'a self,
        request: &'a FetchRequest,
    ) -> BoxFuture<'a, Result<Response, TransportError>> {
        Box::pin(measure("transport.http", m::result, self.get(request)))
    }
}

/// Formats the innermost source of `err`, which is usually the most descriptive.
fn error_message(err: &reqwest::Error) -> String {
    let mut source: &dyn std::error::Error = err;
    while let Some(inner) = source.source() {
        source = inner;
    }
    source.to_string()
}
