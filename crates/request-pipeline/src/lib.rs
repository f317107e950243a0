//! Authenticated request pipeline for the CMS API
//!
//! Every outbound call goes through `RequestPipeline::execute`, which:
//! - attaches the stored access token, refreshing it first when near expiry
//! - merges identical in-flight reads (GET/HEAD) through `RequestCoalescer`
//! - answers a 401 with one coordinated refresh and a single retry
//! - normalizes every outcome into `ApiResponse` or a typed `ApiError`
//!
//! `ApiClient` is the verb surface callers use; it also establishes and ends
//! sessions. All collaborators are constructed by the caller and injected.

pub mod client;
pub mod coalesce;
pub mod descriptor;
pub mod metrics;
pub mod normalize;
pub mod pipeline;

#[cfg(test)]
mod test_support;

pub use client::ApiClient;
pub use coalesce::{DEFAULT_COALESCE_WINDOW, RequestCoalescer};
pub use descriptor::{RequestDescriptor, RequestOptions};
pub use normalize::{ApiError, ApiResponse, ErrorKind, classify_status, normalize};
pub use pipeline::{PipelineConfig, RequestPipeline, SharedOutcome};
