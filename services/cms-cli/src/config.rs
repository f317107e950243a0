//! Configuration types and loading
//!
//! Config precedence: env vars > config file > defaults.
//! `CMS_API_URL` overrides `api.base_url` so one file can target several
//! environments.

use request_pipeline::PipelineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
}

/// CMS API settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Session settings
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    #[serde(default = "default_refresh_skew")]
    pub refresh_skew_secs: u64,
    /// Where the session is kept between runs. Without it every run starts
    /// unauthenticated.
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
}

/// Read coalescing settings
#[derive(Debug, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

fn default_timeout() -> u64 {
    30
}

fn default_refresh_path() -> String {
    session_auth::DEFAULT_REFRESH_PATH.to_string()
}

fn default_refresh_skew() -> u64 {
    session_auth::DEFAULT_REFRESH_SKEW.as_secs()
}

fn default_window_ms() -> u64 {
    request_pipeline::DEFAULT_COALESCE_WINDOW.as_millis() as u64
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_path: default_refresh_path(),
            refresh_skew_secs: default_refresh_skew(),
            credentials_file: None,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(url) = std::env::var("CMS_API_URL") {
            config.api.base_url = url;
        }

        if !config.api.base_url.starts_with("http://")
            && !config.api.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                config.api.base_url
            )));
        }

        if config.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if !config.auth.refresh_path.starts_with('/') {
            return Err(common::Error::Config(format!(
                "refresh_path must start with '/', got: {}",
                config.auth.refresh_path
            )));
        }

        if config.dedup.window_ms == 0 {
            return Err(common::Error::Config(
                "window_ms must be greater than 0".into(),
            ));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("cms-client.toml")
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.dedup.window_ms)
    }

    /// Absolute URL of the refresh endpoint.
    pub fn refresh_endpoint(&self) -> String {
        format!(
            "{}{}",
            self.api.base_url.trim_end_matches('/'),
            self.auth.refresh_path
        )
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig::new(self.api.base_url.clone())
            .with_timeout(self.timeout())
            .with_refresh_skew(Duration::from_secs(self.auth.refresh_skew_secs))
    }
}
