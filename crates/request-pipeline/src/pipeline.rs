//! Authenticated request pipeline
//!
//! Drives one logical call from descriptor to normalized result:
//!
//! 1. Pre-emptive refresh when the stored credentials are near expiry
//! 2. Attach `Authorization: Bearer <access>` (explicit headers win)
//! 3. Send, through the coalescer for safe reads
//! 4. On 401, one coordinated refresh and a single retry
//! 5. Normalize the outcome into `ApiResponse` / `ApiError`
//!
//! A descriptor is retried at most once. A second 401 is terminal and never
//! starts a second refresh.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use session_auth::{CredentialStore, DEFAULT_REFRESH_SKEW, RefreshCoordinator};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use transport::header::{AUTHORIZATION, HeaderValue};
use transport::{DEFAULT_TIMEOUT, Transport, TransportRequest, TransportResponse, Url};
use uuid::Uuid;

use crate::coalesce::RequestCoalescer;
use crate::descriptor::RequestDescriptor;
use crate::metrics;
use crate::normalize::{ApiError, ApiResponse, ErrorKind, auth_expired, normalize};

/// Outcome shared by every caller attached to a coalesced read.
pub type SharedOutcome = transport::Result<TransportResponse>;

/// Pipeline tunables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Base URL that relative request paths are joined to
    pub base_url: String,
    /// Per-transport-call timeout
    pub timeout: Duration,
    /// Refresh this long before the access token expires
    pub refresh_skew: Duration,
}

impl PipelineConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: DEFAULT_TIMEOUT,
            refresh_skew: DEFAULT_REFRESH_SKEW,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_refresh_skew(mut self, skew: Duration) -> Self {
        self.refresh_skew = skew;
        self
    }
}

/// Orchestrates credential attachment, deduplication and refresh-and-retry.
///
/// All collaborators are injected; the pipeline holds no global state.
pub struct RequestPipeline {
    config: PipelineConfig,
    store: Arc<CredentialStore>,
    coordinator: Arc<RefreshCoordinator>,
    coalescer: Arc<RequestCoalescer<SharedOutcome>>,
    transport: Arc<dyn Transport>,
}

impl RequestPipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<CredentialStore>,
        coordinator: Arc<RefreshCoordinator>,
        coalescer: Arc<RequestCoalescer<SharedOutcome>>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            store,
            coordinator,
            coalescer,
            transport,
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Execute one call to completion.
    #[instrument(
        skip_all,
        fields(request_id = %request_id(), method = %descriptor.method, path = %descriptor.path)
    )]
    pub async fn execute(&self, mut descriptor: RequestDescriptor) -> Result<ApiResponse, ApiError> {
        let outcome = self.run(&mut descriptor).await;
        match &outcome {
            Ok(response) => {
                debug!(status = response.status, retried = descriptor.is_retry(), "request succeeded");
                metrics::record_request(descriptor.method.as_str(), "success");
            }
            Err(e) => {
                if e.kind.ends_session() {
                    info!(status = ?e.status, "session expired");
                } else {
                    debug!(kind = %e.kind, status = ?e.status, "request failed");
                }
                metrics::record_request(descriptor.method.as_str(), e.kind.label());
            }
        }
        outcome
    }

    async fn run(&self, descriptor: &mut RequestDescriptor) -> Result<ApiResponse, ApiError> {
        let url = self.resolve_url(descriptor)?;
        // Credentials the pipeline attaches and may refresh for this call
        let managed = !descriptor.skip_auth && !descriptor.has_explicit_authorization();

        if managed && self.store.is_near_expiry(self.config.refresh_skew) {
            debug!("credentials near expiry, refreshing before send");
            let refreshed = self.coordinator.ensure_fresh().await;
            metrics::record_refresh(refreshed);
            if !refreshed {
                warn!("pre-emptive refresh failed, sending without credentials");
            }
        }

        loop {
            let sent_token = if managed {
                self.store.access_token()
            } else {
                None
            };
            let request = self.build_request(descriptor, &url, sent_token.as_ref())?;

            let response = match self.send(descriptor, request).await {
                Ok(response) if response.is_unauthorized() => response,
                other => return normalize(other),
            };

            if !managed {
                return Err(auth_expired(
                    Some(&response),
                    "request was not authorized",
                ));
            }
            if descriptor.is_retry() {
                warn!("still unauthorized after credential refresh");
                return Err(auth_expired(
                    Some(&response),
                    "still unauthorized after credential refresh",
                ));
            }

            if token_rotated(self.store.access_token().as_ref(), sent_token.as_ref()) {
                debug!("credentials rotated by a concurrent refresh, retrying");
            } else {
                debug!("unauthorized, refreshing credentials");
                let refreshed = self.coordinator.ensure_fresh().await;
                metrics::record_refresh(refreshed);
                if !refreshed {
                    return Err(auth_expired(Some(&response), "credential refresh failed"));
                }
            }
            descriptor.mark_retry();
        }
    }

    /// Join the path to the base URL (absolute URLs are used as-is) and
    /// append query parameters.
    fn resolve_url(&self, descriptor: &RequestDescriptor) -> Result<Url, ApiError> {
        let path = descriptor.path.as_str();
        let raw = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!(
                "{}/{}",
                self.config.base_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        };

        let mut url = Url::parse(&raw).map_err(|e| {
            ApiError::new(
                ErrorKind::NetworkFailure,
                format!("invalid request URL {raw}: {e}"),
            )
        })?;
        if !descriptor.query.is_empty() {
            url.query_pairs_mut().extend_pairs(descriptor.query.iter());
        }
        Ok(url)
    }

    fn build_request(
        &self,
        descriptor: &RequestDescriptor,
        url: &Url,
        token: Option<&Secret<String>>,
    ) -> Result<TransportRequest, ApiError> {
        let mut headers = descriptor.headers.clone();
        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose()))
                .map_err(|_| {
                    ApiError::new(
                        ErrorKind::NetworkFailure,
                        "stored access token is not a valid header value",
                    )
                })?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let mut request = TransportRequest::new(descriptor.method.clone(), url.as_str())
            .with_headers(headers)
            .with_timeout(self.config.timeout);
        if let Some(body) = &descriptor.body {
            request = request.with_json(body.clone());
        }
        Ok(request)
    }

    /// Send directly, or through the coalescer for first-attempt safe reads.
    ///
    /// Retries always go straight to the transport so they can never attach
    /// to a sibling still carrying the rejected token.
    async fn send(&self, descriptor: &RequestDescriptor, request: TransportRequest) -> SharedOutcome {
        if descriptor.skip_dedup || descriptor.is_retry() || !descriptor.is_safe_read() {
            return self.transport.send(request).await;
        }

        let key = coalesce_key(&request);
        let transport = self.transport.clone();
        self.coalescer
            .dedupe(&key, move || async move { transport.send(request).await })
            .await
    }
}

/// `METHOD url credential`: reads only merge with reads sent under the same
/// Authorization header. The header is reduced to a digest so no token ends
/// up in the key.
fn coalesce_key(request: &TransportRequest) -> String {
    let credential = match request.headers.get(AUTHORIZATION) {
        Some(value) => {
            let digest = Sha256::digest(value.as_bytes());
            URL_SAFE_NO_PAD.encode(&digest[..12])
        }
        None => "anonymous".to_string(),
    };
    format!("{} {} {}", request.method, request.url, credential)
}

/// True when the store now holds a different token than the one sent.
fn token_rotated(current: Option<&Secret<String>>, sent: Option<&Secret<String>>) -> bool {
    match (current, sent) {
        (Some(current), Some(sent)) => !current.matches(sent.expose()),
        (Some(_), None) => true,
        (None, _) => false,
    }
}

fn request_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}
