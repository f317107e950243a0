//! Transport abstraction for outbound CMS API calls
//!
//! Defines the `Transport` trait that decouples the request pipeline from the
//! HTTP library. `ReqwestTransport` is the production implementation; tests
//! substitute scripted transports that count calls and record headers.
//!
//! A transport only moves bytes: any HTTP status (including 401 and 5xx) is a
//! successful `TransportResponse`. `Error` is reserved for calls that produced
//! no response at all (timeout, refused connection, malformed request).

pub mod reqwest_transport;

pub use reqwest::{Method, StatusCode, Url};
pub use reqwest::header;
pub use reqwest_transport::ReqwestTransport;

use reqwest::header::{AUTHORIZATION, HeaderMap};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Per-call timeout applied when the caller does not choose one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Failures where no response was received.
///
/// `Clone` so a single outcome can be handed to every caller attached to a
/// coalesced request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transport error: {0}")]
    Other(String),
}

impl Error {
    /// Whether the call was abandoned because its timeout elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A fully resolved outbound call.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    /// Absolute URL including any query string
    pub url: String,
    pub headers: HeaderMap,
    /// JSON body, serialized by the transport
    pub body: Option<serde_json::Value>,
    pub timeout: Duration,
}

impl TransportRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The bearer token carried in the Authorization header, if any.
    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
    }
}

/// Status, headers and raw body of a received response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// 2xx status
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }
}

/// Abstraction over the HTTP library.
///
/// Uses a `Pin<Box<dyn Future>>` return type for dyn-compatibility
/// (`Arc<dyn Transport>`), so the pipeline can hold any transport behind one
/// pointer and move clones of it into shared futures.
pub trait Transport: Send + Sync {
    /// Send one request and wait for its complete response.
    ///
    /// Implementations must enforce `request.timeout` and report its expiry
    /// as `Error::Timeout`.
    fn send(
        &self,
        request: TransportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse>> + Send + '_>>;
}
