//! Token endpoint contract and the refresh call
//!
//! Login, registration and refresh all answer with the same token payload:
//! a new access token, a new refresh token and a lifetime in seconds. The
//! CMS backend uses camelCase and sometimes wraps the payload in a `data`
//! envelope; both shapes are accepted.
//!
//! `Refresher` is the seam the coordinator calls. `HttpRefresher` POSTs the
//! current refresh token to the refresh endpoint over a `Transport`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use transport::{DEFAULT_TIMEOUT, Method, Transport, TransportRequest};

use crate::constants::REFRESH_TOKEN_FIELD;
use crate::error::{Error, Result};

/// Token payload from the login, registration and refresh endpoints.
///
/// `expires_in` is a delta in seconds from the response time. The store
/// converts it to an absolute timestamp.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(alias = "refreshToken")]
    pub refresh_token: String,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(alias = "expiresIn")]
    pub expires_in: u64,
}

#[derive(Deserialize)]
struct Envelope {
    data: TokenResponse,
}

/// Parse a token payload, bare or inside a `data` envelope.
pub fn parse_token_response(body: &str) -> Result<TokenResponse> {
    match serde_json::from_str::<TokenResponse>(body) {
        Ok(tokens) => Ok(tokens),
        Err(bare_err) => serde_json::from_str::<Envelope>(body)
            .map(|envelope| envelope.data)
            .map_err(|_| Error::TokenExchange(format!("invalid token response: {bare_err}"))),
    }
}

/// Exchanges a refresh token for a new token pair.
///
/// Implementations make exactly one attempt; the coordinator never retries.
pub trait Refresher: Send + Sync {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>>;
}

/// Refresh over HTTP: `POST {endpoint}` with `{"refreshToken": "..."}`.
///
/// Carries no Authorization header; the refresh token is the credential.
pub struct HttpRefresher {
    transport: Arc<dyn Transport>,
    endpoint: String,
    timeout: Duration,
}

impl HttpRefresher {
    pub fn new(transport: Arc<dyn Transport>, endpoint: impl Into<String>) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Refresher for HttpRefresher {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>> {
        Box::pin(async move {
            let request = TransportRequest::new(Method::POST, self.endpoint.as_str())
                .with_json(serde_json::json!({ REFRESH_TOKEN_FIELD: refresh_token }))
                .with_timeout(self.timeout);

            let response = self
                .transport
                .send(request)
                .await
                .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

            if !response.is_success() {
                // 401/403 means the refresh token is revoked or invalid
                if response.status == 401 || response.status == 403 {
                    return Err(Error::InvalidCredentials(format!(
                        "refresh token rejected ({}): {}",
                        response.status, response.body
                    )));
                }
                return Err(Error::TokenExchange(format!(
                    "token refresh returned {}: {}",
                    response.status, response.body
                )));
            }

            parse_token_response(&response.body)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use transport::{TransportResponse, header::AUTHORIZATION};

    /// Transport that records the last request and replies with a fixed outcome.
    struct RecordingTransport {
        reply: transport::Result<TransportResponse>,
        last: Mutex<Option<TransportRequest>>,
    }

    impl RecordingTransport {
        fn replying(reply: transport::Result<TransportResponse>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                last: Mutex::new(None),
            })
        }
    }

    impl Transport for RecordingTransport {
        fn send(
            &self,
            request: TransportRequest,
        ) -> Pin<Box<dyn Future<Output = transport::Result<TransportResponse>> + Send + '_>>
        {
            *self.last.lock() = Some(request);
            let reply = self.reply.clone();
            Box::pin(async move { reply })
        }
    }

    #[test]
    fn parses_snake_case_payload() {
        let tokens =
            parse_token_response(r#"{"access_token":"at_a","refresh_token":"rt_b","expires_in":3600}"#)
                .unwrap();
        assert_eq!(tokens.access_token, "at_a");
        assert_eq!(tokens.refresh_token, "rt_b");
        assert_eq!(tokens.expires_in, 3600);
    }

    #[test]
    fn parses_camel_case_payload_in_data_envelope() {
        let body = r#"{"data":{"accessToken":"at_c","refreshToken":"rt_d","expiresIn":900},"ok":true}"#;
        let tokens = parse_token_response(body).unwrap();
        assert_eq!(tokens.access_token, "at_c");
        assert_eq!(tokens.refresh_token, "rt_d");
        assert_eq!(tokens.expires_in, 900);
    }

    #[test]
    fn missing_refresh_token_is_rejected() {
        let result = parse_token_response(r#"{"accessToken":"at","expiresIn":60}"#);
        assert!(matches!(result, Err(Error::TokenExchange(_))));
    }

    #[tokio::test]
    async fn posts_refresh_token_without_authorization() {
        let transport = RecordingTransport::replying(Ok(TransportResponse::new(
            200,
            r#"{"accessToken":"at_new","refreshToken":"rt_new","expiresIn":3600}"#,
        )));
        let refresher = HttpRefresher::new(transport.clone(), "https://cms.test/auth/refresh")
            .with_timeout(Duration::from_secs(5));

        let tokens = refresher.refresh("rt_old").await.unwrap();
        assert_eq!(tokens.access_token, "at_new");

        let sent = transport.last.lock().take().unwrap();
        assert_eq!(sent.method, Method::POST);
        assert_eq!(sent.url, "https://cms.test/auth/refresh");
        assert_eq!(sent.timeout, Duration::from_secs(5));
        assert_eq!(sent.body.unwrap()["refreshToken"], "rt_old");
        assert!(sent.headers.get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn unauthorized_is_invalid_credentials() {
        let transport =
            RecordingTransport::replying(Ok(TransportResponse::new(401, "token revoked")));
        let refresher = HttpRefresher::new(transport, "https://cms.test/auth/refresh");

        let err = refresher.refresh("rt_revoked").await.unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn server_error_is_token_exchange_failure() {
        let transport = RecordingTransport::replying(Ok(TransportResponse::new(503, "down")));
        let refresher = HttpRefresher::new(transport, "https://cms.test/auth/refresh");

        let err = refresher.refresh("rt").await.unwrap_err();
        assert!(matches!(err, Error::TokenExchange(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn transport_failure_is_http_error() {
        let transport = RecordingTransport::replying(Err(transport::Error::Timeout(
            "no response within 30000ms".into(),
        )));
        let refresher = HttpRefresher::new(transport, "https://cms.test/auth/refresh");

        let err = refresher.refresh("rt").await.unwrap_err();
        assert!(matches!(err, Error::Http(_)), "got {err:?}");
    }
}
