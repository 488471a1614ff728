//! HTTP transport seam.
//!
//! The client only needs "send this request, give me status, headers and
//! body". [`Transport`] is that seam; [`ReqwestTransport`] is the production
//! implementation and tests plug in scripted fakes.

use crate::config::ConfigError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// Default upstream base URL.
pub const DEFAULT_BASE_URL: &str = "https://esi.evetech.net/latest";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Per-call options: method, extra headers and body.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self { method: Method::GET, headers: HeaderMap::new(), body: None }
    }
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// A request for an upstream path.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// Path relative to the transport's base URL, or an absolute URL.
    pub path: String,
    pub options: FetchOptions,
}

impl ApiRequest {
    pub fn new(path: impl Into<String>, options: FetchOptions) -> Self {
        Self { path: path.into(), options }
    }

    /// A plain `GET` of `path`.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(path, FetchOptions::default())
    }
}

/// A fully read upstream response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
}

impl ApiResponse {
    pub fn new(status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self { status, headers, body: body.into() }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Value of header `name` (case-insensitive) if it is valid text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Body as text; invalid UTF-8 is replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Failure to obtain any response from the upstream.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// The request URL could not be formed.
    #[error("invalid request url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    /// No response arrived within the transport's timeout.
    #[error("request timed out")]
    Timeout,
    /// The connection could not be established.
    #[error("connection failed: {0}")]
    Connect(#[source] BoxError),
    /// Any other failure while sending or reading the response.
    #[error("transport failure: {0}")]
    Other(#[source] BoxError),
}

impl TransportError {
    /// Wrap an arbitrary failure of a custom transport.
    pub fn other(error: impl Into<BoxError>) -> Self {
        TransportError::Other(error.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            TransportError::Timeout
        } else if error.is_connect() {
            TransportError::Connect(Box::new(error))
        } else {
            TransportError::Other(Box::new(error))
        }
    }
}

/// Sends one request and reads the whole response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        (**self).send(request).await
    }
}

/// [`Transport`] over a `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: Url,
}

impl ReqwestTransport {
    pub fn builder() -> ReqwestTransportBuilder {
        ReqwestTransportBuilder::default()
    }

    /// Use an existing client; `base_url` must be an absolute URL.
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Result<Self, ConfigError> {
        Ok(Self { client, base_url: parse_base_url(base_url)? })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Absolute URL for `path`; absolute URLs pass through.
    pub fn url_for(&self, path: &str) -> Result<Url, TransportError> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Url::parse(path).map_err(|e| TransportError::InvalidUrl {
                url: path.to_string(),
                reason: e.to_string(),
            });
        }
        let joined = format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined)
            .map_err(|e| TransportError::InvalidUrl { url: joined.clone(), reason: e.to_string() })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = self.url_for(&request.path)?;
        let mut builder = self
            .client
            .request(request.options.method.clone(), url)
            .headers(request.options.headers.clone());
        if let Some(body) = &request.options.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(ApiResponse { status, headers, body })
    }
}

/// Builder for [`ReqwestTransport`].
#[derive(Debug)]
pub struct ReqwestTransportBuilder {
    base_url: String,
    user_agent: Option<String>,
    default_headers: HeaderMap,
    timeout: Duration,
}

impl Default for ReqwestTransportBuilder {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: None,
            default_headers: HeaderMap::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ReqwestTransportBuilder {
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// The upstream asks callers to identify themselves.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Headers sent with every request.
    pub fn default_headers(mut self, headers: HeaderMap) -> Self {
        self.default_headers = headers;
        self
    }

    /// Per-call timeout covering connect, send and body read.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ReqwestTransport, ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "timeout" });
        }
        let base_url = parse_base_url(&self.base_url)?;
        let mut builder =
            reqwest::Client::builder().timeout(self.timeout).default_headers(self.default_headers);
        if let Some(user_agent) = self.user_agent {
            builder = builder.user_agent(user_agent);
        }
        let client = builder.build().map_err(ConfigError::HttpClient)?;
        Ok(ReqwestTransport { client, base_url })
    }
}

fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw)
        .map_err(|e| ConfigError::InvalidBaseUrl { url: raw.to_string(), reason: e.to_string() })?;
    if url.cannot_be_a_base() {
        return Err(ConfigError::InvalidBaseUrl {
            url: raw.to_string(),
            reason: "not a base url".to_string(),
        });
    }
    Ok(url)
}
