//! Session defaults shared by the store, the refresher and the pipeline

use std::time::Duration;

/// Credentials expiring within this margin are refreshed before use.
pub const DEFAULT_REFRESH_SKEW: Duration = Duration::from_secs(300);

/// Refresh endpoint path, relative to the API base URL.
pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";

/// JSON field carrying the refresh token in the refresh request body.
pub const REFRESH_TOKEN_FIELD: &str = "refreshToken";
