//! Caller-facing API surface
//!
//! Thin verb methods over `RequestPipeline`, plus session establishment.
//! Login and registration send the caller's credentials without
//! authorization, parse the token payload (same contract as refresh) and
//! seed the credential store.

use std::sync::Arc;

use serde_json::Value;
use session_auth::{Error as AuthError, parse_token_response};
use tracing::{info, warn};
use transport::Method;

use crate::descriptor::{RequestDescriptor, RequestOptions};
use crate::normalize::{ApiError, ApiResponse, ErrorKind};
use crate::pipeline::RequestPipeline;

/// Handle for making CMS API calls. Cheap to clone.
#[derive(Clone)]
pub struct ApiClient {
    pipeline: Arc<RequestPipeline>,
}

impl ApiClient {
    pub fn new(pipeline: RequestPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }

    pub async fn request(&self, descriptor: RequestDescriptor) -> Result<ApiResponse, ApiError> {
        self.pipeline.execute(descriptor).await
    }

    pub async fn get(&self, path: &str, options: RequestOptions) -> Result<ApiResponse, ApiError> {
        self.request(RequestDescriptor::new(Method::GET, path).with_options(options))
            .await
    }

    pub async fn delete(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        self.request(RequestDescriptor::new(Method::DELETE, path).with_options(options))
            .await
    }

    pub async fn post(
        &self,
        path: &str,
        body: Value,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        self.send_with_body(Method::POST, path, body, options).await
    }

    pub async fn put(
        &self,
        path: &str,
        body: Value,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        self.send_with_body(Method::PUT, path, body, options).await
    }

    pub async fn patch(
        &self,
        path: &str,
        body: Value,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        self.send_with_body(Method::PATCH, path, body, options).await
    }

    async fn send_with_body(
        &self,
        method: Method,
        path: &str,
        body: Value,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        let descriptor = RequestDescriptor::new(method, path)
            .with_body(body)
            .with_options(options);
        self.request(descriptor).await
    }

    /// Exchange user credentials for a session.
    pub async fn login(&self, path: &str, credentials: Value) -> Result<(), ApiError> {
        self.establish_session(path, credentials).await
    }

    /// Create an account and start its session.
    pub async fn register(&self, path: &str, details: Value) -> Result<(), ApiError> {
        self.establish_session(path, details).await
    }

    /// End the session. The in-memory pair is always dropped; an error means
    /// the persisted copy could not be removed.
    pub fn logout(&self) -> session_auth::Result<()> {
        let result = self.pipeline.store().clear();
        info!("logged out");
        result
    }

    pub fn is_authenticated(&self) -> bool {
        self.pipeline.store().is_authenticated()
    }

    async fn establish_session(&self, path: &str, body: Value) -> Result<(), ApiError> {
        let descriptor = RequestDescriptor::new(Method::POST, path)
            .with_body(body)
            .with_options(RequestOptions::new().skip_auth().skip_dedup());
        let response = self.request(descriptor).await?;

        let tokens = parse_token_response(&response.body).map_err(|e| malformed(&response, e))?;
        match self
            .pipeline
            .store()
            .set(tokens.access_token, tokens.refresh_token, tokens.expires_in)
        {
            Ok(()) => {}
            Err(e @ AuthError::InvalidCredentials(_)) => return Err(malformed(&response, e)),
            Err(e) => warn!(error = %e, "session established but not persisted"),
        }

        info!(expires_in_secs = tokens.expires_in, "session established");
        Ok(())
    }
}

fn malformed(response: &ApiResponse, error: AuthError) -> ApiError {
    ApiError {
        kind: ErrorKind::ServerError,
        message: format!("unusable token response: {error}"),
        status: Some(response.status),
        body: Some(response.body.clone()),
    }
}
