//! Runtime configuration.
//!
//! A [`Config`] is built once (defaults, optional JSON file, CLI overrides) and
//! handed to the queue, connector and orchestrator constructors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

pub const DEFAULT_ROW_LIMIT: usize = 10_000;
pub const DEFAULT_BASE_URL: &str = "https://statistik.bra.se/solwebb/action/";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upper bound on the estimated number of rows a single tile may return.
    pub row_limit: usize,
    pub db_path: PathBuf,
    /// Cached topics and dimension tables.
    pub catalog_path: PathBuf,
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Extra attempts per protocol step before the topic run is aborted.
    pub step_retries: u32,
    pub retry_backoff_ms: u64,
    /// Capacity of the channel between the orchestrator and the response writer.
    pub persist_capacity: usize,
    /// When set, a tile that failed validation this many times is moved to `Error`.
    pub max_validation_failures: Option<u32>,
    pub accept_invalid_certs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            row_limit: DEFAULT_ROW_LIMIT,
            db_path: PathBuf::from("requests.db"),
            catalog_path: PathBuf::from("catalog.json"),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: 120,
            connect_timeout_secs: 30,
            step_retries: 0,
            retry_backoff_ms: 500,
            persist_capacity: 16,
            max_validation_failures: None,
            accept_invalid_certs: true,
        }
    }
}

impl Config {
    /// Reads a JSON config file. Missing keys fall back to the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.row_limit == 0 {
            return Err(Error::Config("row_limit must be at least 1".into()));
        }
        if self.persist_capacity == 0 {
            return Err(Error::Config("persist_capacity must be at least 1".into()));
        }
        if self.max_validation_failures == Some(0) {
            return Err(Error::Config(
                "max_validation_failures must be at least 1 when set".into(),
            ));
        }
        if self.base_url.trim().is_empty() {
            return Err(Error::Config("base_url must not be empty".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
