//! The merged per-session health record and its persistence.
//!
//! Every data source writes into one [`SessionHealth`] through its own merge
//! function. The record is persisted after each gather and handed to the next
//! invocation as its starting point, so a source that contributes nothing this
//! round keeps its previous value and is marked in [`SessionHealth::sources`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{validate_identifier, Result, StatuslineError};
use crate::scanner::ScanResult;
use crate::storage::{atomic_write, StorageConfig};

pub const HEALTH_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionHealth {
    pub version: u32,
    pub session_id: String,
    /// Epoch ms at which the gather that produced this record finished.
    pub gathered_at: i64,
    pub model: Option<ModelInfo>,
    pub workspace: Option<WorkspaceInfo>,
    pub cost: Option<CostInfo>,
    pub context: Option<ContextUsage>,
    pub transcript: Option<ScanResult>,
    pub auth: Option<AuthInfo>,
    pub git: Option<GitStatus>,
    pub billing: Option<BillingInfo>,
    /// Shape owned by the configured quota command.
    pub quota: Option<Value>,
    pub sources: BTreeMap<String, SourceStatus>,
}

impl SessionHealth {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            version: HEALTH_VERSION,
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    pub fn mark(&mut self, source_id: &str, status: SourceStatus) {
        self.sources.insert(source_id.to_string(), status);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelInfo {
    pub id: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceInfo {
    pub project_dir: Option<String>,
    pub current_dir: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostInfo {
    pub total_cost_usd: f64,
    pub total_duration_ms: u64,
    pub lines_added: u64,
    pub lines_removed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextUsage {
    pub used_tokens: u64,
    pub window_size: Option<u64>,
    pub used_percentage: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthInfo {
    pub email: Option<String>,
    pub organization: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitStatus {
    pub branch: Option<String>,
    pub ahead: u32,
    pub behind: u32,
    pub staged: u32,
    pub unstaged: u32,
    pub untracked: u32,
}

impl GitStatus {
    pub fn is_dirty(&self) -> bool {
        self.staged + self.unstaged + self.untracked > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingInfo {
    pub block_cost_usd: f64,
    pub burn_rate_per_hour: Option<f64>,
    /// RFC 3339 end of the active billing block.
    pub resets_at: Option<String>,
}

/// How a source fared in the latest gather.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    /// Merged from a cache entry within its TTL.
    Fresh,
    /// Merged from an expired cache entry; someone else holds the refresh.
    Stale,
    /// Fetched by this process.
    Fetched,
    /// No cache entry; fetched directly without coordination.
    Fallback,
    Failed,
    TimedOut,
    /// Not run (dependency missing or deadline already passed).
    Skipped,
}

impl SourceState {
    /// Whether the source's field holds a value from this gather or the shared cache.
    pub fn has_value(self) -> bool {
        matches!(
            self,
            SourceState::Fresh | SourceState::Stale | SourceState::Fetched | SourceState::Fallback
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub state: SourceState,
    /// Age of the merged value, when it came from the shared cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceStatus {
    pub fn new(state: SourceState) -> Self {
        Self {
            state,
            age_ms: None,
            error: None,
        }
    }

    pub fn with_age(state: SourceState, age_ms: u64) -> Self {
        Self {
            age_ms: Some(age_ms),
            ..Self::new(state)
        }
    }

    pub fn failed(state: SourceState, error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(state)
        }
    }
}

/// Persists one [`SessionHealth`] per session under `health/`.
#[derive(Debug, Clone)]
pub struct HealthStore {
    storage: StorageConfig,
}

impl HealthStore {
    pub fn new(storage: StorageConfig) -> Self {
        Self { storage }
    }

    /// Previous record for `session_id`. Missing, corrupt, foreign-version, or
    /// invalid-id all mean "no previous record".
    pub fn load(&self, session_id: &str) -> Option<SessionHealth> {
        validate_identifier(session_id).ok()?;
        let path = self.storage.health_file(session_id);
        let content = fs_err::read_to_string(&path).ok()?;
        match serde_json::from_str::<SessionHealth>(&content) {
            Ok(health) if health.version == HEALTH_VERSION => Some(health),
            Ok(health) => {
                tracing::debug!(session = %session_id, version = health.version, "Ignoring health record from another version");
                None
            }
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "Corrupt health record; starting fresh");
                None
            }
        }
    }

    pub fn save(&self, health: &SessionHealth) -> Result<()> {
        validate_identifier(&health.session_id)?;
        let content = serde_json::to_vec_pretty(health)
            .map_err(|e| StatuslineError::json("serialize health record", e))?;
        atomic_write(&self.storage.health_file(&health.session_id), &content)
    }
}
