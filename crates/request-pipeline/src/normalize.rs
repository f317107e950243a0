//! Error normalization
//!
//! Collapses transport failures and error statuses into the closed
//! `ErrorKind` taxonomy. Every `ApiError` carries a human-readable message
//! (taken from the response body when the server supplied one), the status
//! when a response was received, and the raw body for callers that need more.
//!
//! Nothing here can fail: every input maps to a constructed value.

use std::fmt;

use serde::de::DeserializeOwned;
use transport::header::HeaderMap;
use transport::{StatusCode, TransportResponse};

/// Closed set of failures a caller can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 401 after a failed refresh or after the single retry; the session is over
    AuthExpired,
    /// 403, never refreshed
    Forbidden,
    /// 404
    NotFound,
    /// 409
    Conflict,
    /// 400, 422 and any other 4xx
    Validation,
    /// 5xx and any other non-success status
    ServerError,
    /// No response: timeout, refused connection, unusable request URL
    NetworkFailure,
}

impl ErrorKind {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::AuthExpired => "auth_expired",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::ServerError => "server_error",
            ErrorKind::NetworkFailure => "network_failure",
        }
    }

    /// Whether the caller should end the session (log out) on this error.
    /// Every other kind is request-level.
    pub fn ends_session(&self) -> bool {
        matches!(self, ErrorKind::AuthExpired)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Terminal failure of a pipeline call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    /// HTTP status, when a response was received
    pub status: Option<u16>,
    /// Raw response body, when a response was received
    pub body: Option<String>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            body: None,
        }
    }

    /// Build from an error response, preferring the server's own message.
    pub fn from_response(kind: ErrorKind, response: &TransportResponse) -> Self {
        Self {
            kind,
            message: message_from_body(&response.body)
                .unwrap_or_else(|| reason_phrase(response.status)),
            status: Some(response.status),
            body: Some(response.body.clone()),
        }
    }
}

/// Successful (2xx) response handed back to the caller.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl ApiResponse {
    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.body)
    }
}

/// Classify an HTTP status. `None` for 2xx.
pub fn classify_status(status: u16) -> Option<ErrorKind> {
    match status {
        200..=299 => None,
        401 => Some(ErrorKind::AuthExpired),
        403 => Some(ErrorKind::Forbidden),
        404 => Some(ErrorKind::NotFound),
        409 => Some(ErrorKind::Conflict),
        400..=499 => Some(ErrorKind::Validation),
        _ => Some(ErrorKind::ServerError),
    }
}

/// Map a transport outcome to the caller-facing result.
pub fn normalize(
    outcome: transport::Result<TransportResponse>,
) -> Result<ApiResponse, ApiError> {
    match outcome {
        Ok(response) => match classify_status(response.status) {
            None => Ok(ApiResponse {
                status: response.status,
                headers: response.headers,
                body: response.body,
            }),
            Some(kind) => Err(ApiError::from_response(kind, &response)),
        },
        Err(e) => Err(network_failure(&e)),
    }
}

/// No response was received.
pub fn network_failure(error: &transport::Error) -> ApiError {
    ApiError::new(ErrorKind::NetworkFailure, error.to_string())
}

/// Terminal authorization failure. `reason` is used when the response (if
/// any) carries no message of its own.
pub fn auth_expired(response: Option<&TransportResponse>, reason: &str) -> ApiError {
    match response {
        Some(response) => {
            let mut err = ApiError::from_response(ErrorKind::AuthExpired, response);
            if message_from_body(&response.body).is_none() {
                err.message = reason.to_string();
            }
            err
        }
        None => ApiError::new(ErrorKind::AuthExpired, reason),
    }
}

/// Pull a message out of a JSON error body: `message`, `error.message`, or a
/// string `error`.
fn message_from_body(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let message = value
        .get("message")
        .and_then(|m| m.as_str())
        .or_else(|| value.pointer("/error/message").and_then(|m| m.as_str()))
        .or_else(|| value.get("error").and_then(|m| m.as_str()))?;
    let message = message.trim();
    (!message.is_empty()).then(|| message.to_string())
}

fn reason_phrase(status: u16) -> String {
    match StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
    {
        Some(reason) => format!("HTTP {status} {reason}"),
        None => format!("HTTP {status}"),
    }
}
