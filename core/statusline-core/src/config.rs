//! User preferences loaded from `config.toml` under the storage root.
//!
//! A missing file means defaults. A malformed file is logged and also means
//! defaults; the status line must render regardless.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StatuslineError};
use crate::storage::StorageConfig;

pub const DEFAULT_DEADLINE_MS: u64 = 20_000;
pub const DEFAULT_RESULT_CACHE_TTL_SECS: u64 = 10;
pub const DEFAULT_MAX_RETAINED_EVENTS: usize = 100;
pub const DEFAULT_MAX_RETAINED_SECRETS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Absolute budget for one gather, measured from process start.
    pub deadline_ms: u64,
    /// Lifetime of same-process scan results.
    pub result_cache_ttl_secs: u64,
    /// Retention bound for accumulated commands and auth changes.
    pub max_retained_events: usize,
    /// Retention bound for accumulated secrets.
    pub max_retained_secrets: usize,
    /// Overrides every freshness category's lock timeout when set.
    pub lock_timeout_secs: Option<u64>,
    /// argv for the billing fetcher; `None` disables the source.
    pub billing_command: Option<Vec<String>>,
    /// argv for the quota fetcher; `None` disables the source.
    pub quota_command: Option<Vec<String>>,
    pub git_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            deadline_ms: DEFAULT_DEADLINE_MS,
            result_cache_ttl_secs: DEFAULT_RESULT_CACHE_TTL_SECS,
            max_retained_events: DEFAULT_MAX_RETAINED_EVENTS,
            max_retained_secrets: DEFAULT_MAX_RETAINED_SECRETS,
            lock_timeout_secs: None,
            billing_command: Some(
                ["ccusage", "blocks", "--active", "--json"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
            quota_command: None,
            git_enabled: true,
        }
    }
}

impl Config {
    /// Loads `config.toml` from the storage root, falling back to defaults.
    pub fn load(storage: &StorageConfig) -> Self {
        let path = storage.config_file();
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to load config; using defaults");
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs_err::read_to_string(path)
            .map_err(|e| StatuslineError::io(format!("read {}", path.display()), e))?;
        toml::from_str::<Config>(&content).map_err(|e| StatuslineError::Config {
            path: path.to_path_buf(),
            details: e.to_string(),
        })
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn result_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.result_cache_ttl_secs)
    }
}
