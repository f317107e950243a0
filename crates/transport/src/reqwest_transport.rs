//! `reqwest`-backed transport
//!
//! Sends the request as-is (headers verbatim, JSON body when present) with the
//! request's own timeout, and returns the upstream status and body without
//! interpreting them. Error statuses are responses, not errors.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::{Error, Result, Transport, TransportRequest, TransportResponse};

/// Production transport over a shared `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for ReqwestTransport {
    fn send(
        &self,
        request: TransportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse>> + Send + '_>> {
        Box::pin(send_request(&self.client, request))
    }
}

#[instrument(skip_all, fields(method = %request.method, url = %request.url))]
async fn send_request(
    client: &reqwest::Client,
    request: TransportRequest,
) -> Result<TransportResponse> {
    let TransportRequest {
        method,
        url,
        headers,
        body,
        timeout,
    } = request;

    let mut builder = client
        .request(method, &url)
        .headers(headers)
        .timeout(timeout);
    if let Some(body) = &body {
        builder = builder.json(body);
    }

    let response = builder
        .send()
        .await
        .map_err(|e| classify_error(e, timeout))?;

    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = response
        .text()
        .await
        .map_err(|e| classify_error(e, timeout))?;

    debug!(status, bytes = body.len(), "received response");
    Ok(TransportResponse {
        status,
        headers,
        body,
    })
}

/// Map a reqwest failure onto the transport error kinds.
fn classify_error(error: reqwest::Error, timeout: Duration) -> Error {
    if error.is_timeout() {
        Error::Timeout(format!("no response within {}ms", timeout.as_millis()))
    } else if error.is_connect() {
        Error::Connect(error.to_string())
    } else if error.is_builder() {
        Error::InvalidRequest(error.to_string())
    } else {
        Error::Other(error.to_string())
    }
}
