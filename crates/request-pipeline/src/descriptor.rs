//! Per-call request description and caller options

use serde_json::Value;
use transport::Method;
use transport::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};

/// Per-call switches supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Send without credentials and never refresh for this call
    pub skip_auth: bool,
    /// Always perform a fresh transport call
    pub skip_dedup: bool,
    /// Extra headers; an explicit Authorization header wins over the store
    pub headers: HeaderMap,
    /// Query parameters appended to the path in order
    pub query: Vec<(String, String)>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }

    pub fn skip_dedup(mut self) -> Self {
        self.skip_dedup = true;
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// One logical API call.
///
/// Immutable once built, apart from the retry mark the pipeline sets before
/// its single retry.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    /// Path relative to the base URL, or an absolute URL used as-is
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub headers: HeaderMap,
    pub skip_auth: bool,
    pub skip_dedup: bool,
    is_retry: bool,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            headers: HeaderMap::new(),
            skip_auth: false,
            skip_dedup: false,
            is_retry: false,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.skip_auth = options.skip_auth;
        self.skip_dedup = options.skip_dedup;
        self.headers.extend(options.headers);
        self.query.extend(options.query);
        self
    }

    /// Whether this descriptor already went through its one retry.
    pub fn is_retry(&self) -> bool {
        self.is_retry
    }

    /// Set once, right before the retry is sent.
    pub(crate) fn mark_retry(&mut self) {
        debug_assert!(!self.is_retry, "a request is retried at most once");
        self.is_retry = true;
    }

    /// GET and HEAD are the only methods eligible for coalescing.
    pub fn is_safe_read(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }

    pub fn has_explicit_authorization(&self) -> bool {
        self.headers.contains_key(AUTHORIZATION)
    }
}
