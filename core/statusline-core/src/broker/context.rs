//! Per-invocation gather context.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::config::Config;
use crate::error::validate_identifier;
use crate::health::{HealthStore, SessionHealth};
use crate::storage::StorageConfig;

/// Session id used when the host input carries none (or an unusable one).
pub const ANONYMOUS_SESSION: &str = "anonymous";

/// Everything a source may read. Immutable once built.
#[derive(Debug, Clone)]
pub struct GatherContext {
    pub session_id: String,
    pub transcript_path: Option<PathBuf>,
    /// The host's JSON payload, verbatim.
    pub raw_input: Value,
    /// Claude Code's data directory (read-only).
    pub config_dir: PathBuf,
    /// Absolute cutoff shared by every tier.
    pub deadline: Instant,
    pub existing_health: Option<SessionHealth>,
    pub project_path: Option<PathBuf>,
    pub storage: StorageConfig,
    pub config: Config,
}

impl GatherContext {
    /// Minimal context, mostly for tests and the `scan` subcommand.
    pub fn new(session_id: impl Into<String>, storage: StorageConfig, config: Config) -> Self {
        Self {
            session_id: session_id.into(),
            transcript_path: None,
            raw_input: Value::Null,
            config_dir: storage.claude_root().to_path_buf(),
            deadline: Instant::now() + config.deadline(),
            existing_health: None,
            project_path: None,
            storage,
            config,
        }
    }

    /// Builds the context from the host's stdin payload, loading the previous
    /// health record for the session.
    pub fn from_host_input(raw_input: Value, storage: &StorageConfig, config: &Config) -> Self {
        let session_id = raw_input
            .get("session_id")
            .and_then(Value::as_str)
            .filter(|id| validate_identifier(id).is_ok())
            .unwrap_or(ANONYMOUS_SESSION)
            .to_string();

        let transcript_path = str_field(&raw_input, &["transcript_path"]).map(PathBuf::from);
        let project_path = str_field(&raw_input, &["workspace", "project_dir"])
            .or_else(|| str_field(&raw_input, &["workspace", "current_dir"]))
            .or_else(|| str_field(&raw_input, &["cwd"]))
            .map(PathBuf::from);

        let existing_health = HealthStore::new(storage.clone()).load(&session_id);

        Self {
            session_id,
            transcript_path,
            raw_input,
            config_dir: storage.claude_root().to_path_buf(),
            deadline: Instant::now() + config.deadline(),
            existing_health,
            project_path,
            storage: storage.clone(),
            config: config.clone(),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_transcript(mut self, path: impl Into<PathBuf>) -> Self {
        self.transcript_path = Some(path.into());
        self
    }

    pub fn with_project(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_path = Some(path.into());
        self
    }

    pub fn with_raw_input(mut self, raw_input: Value) -> Self {
        self.raw_input = raw_input;
        self
    }

    pub fn with_existing_health(mut self, health: SessionHealth) -> Self {
        self.existing_health = Some(health);
        self
    }

    /// Time left before the deadline (zero once passed).
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Nested string field of the raw input, e.g. `["workspace", "current_dir"]`.
    pub fn input_str(&self, path: &[&str]) -> Option<&str> {
        str_field(&self.raw_input, path)
    }
}

fn str_field<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |v, key| v.get(*key))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}
