//! Pipeline metrics
//!
//! Recorded through the `metrics` facade; whichever recorder the host
//! application installs receives them. Without a recorder every call is a
//! no-op.
//!
//! - `pipeline_requests_total` (counter): labels `method`, `outcome`
//! - `pipeline_coalesced_total` (counter): callers that joined an in-flight read
//! - `pipeline_refresh_total` (counter): label `outcome` (`refreshed` / `failed`)

/// Record a finished pipeline call with its method and outcome label.
pub fn record_request(method: &str, outcome: &str) {
    metrics::counter!(
        "pipeline_requests_total",
        "method" => method.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a caller served by an already in-flight request.
pub fn record_coalesced() {
    metrics::counter!("pipeline_coalesced_total").increment(1);
}

/// Record the outcome of a refresh the pipeline waited on.
pub fn record_refresh(refreshed: bool) {
    let outcome = if refreshed { "refreshed" } else { "failed" };
    metrics::counter!("pipeline_refresh_total", "outcome" => outcome).increment(1);
}
