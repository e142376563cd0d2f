//! # statusline-core
//!
//! Core library for the Claude Code status line. The host spawns a fresh
//! process on every UI refresh, so everything here is built around many
//! short-lived processes cooperating through the filesystem.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. Fan-out uses plain threads.
//! - **Incremental**: Transcripts are read from a persisted byte offset; only new
//!   lines are parsed and handed to extractors.
//! - **Graceful degradation**: Missing or corrupt files return empty/default values,
//!   not errors. The worst observable outcome is a stale or absent field.
//! - **Atomic writes**: Every persisted file is published via temp file + rename.
//! - **Single-flight**: Expensive global refreshes are guarded by lock files so at
//!   most one process performs them.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use statusline_core::{Config, DataSourceRegistry, GatherContext, StorageConfig, UnifiedDataBroker};
//!
//! let storage = StorageConfig::default();
//! let config = Config::load(&storage);
//! let registry = DataSourceRegistry::builtin(&config)?;
//! let broker = UnifiedDataBroker::new(registry, storage.clone());
//! let ctx = GatherContext::from_host_input(raw_input, &storage, &config);
//! let health = broker.gather_all(ctx);
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod freshness;
pub mod health;
pub mod scanner;
pub mod storage;

pub use broker::{
    DataSourceDescriptor, DataSourceRegistry, GatherContext, GlobalDataCache, SingleFlightCoordinator,
    Tier, UnifiedDataBroker,
};
pub use config::Config;
pub use error::{FetchError, Result, StatuslineError};
pub use freshness::{Freshness, FreshnessCategory, FreshnessPolicy};
pub use health::{HealthStore, SessionHealth, SourceStatus};
pub use scanner::{ScanResult, Scanner};
pub use storage::StorageConfig;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
