//! Storage configuration and path management for the status line.
//!
//! `StorageConfig` is the one place that decides where things live on disk.
//! Production code uses `StorageConfig::default()` which points to `~/.statusline/`
//! (or `$STATUSLINE_HOME`). Tests use `StorageConfig::with_root(temp_dir)`.
//!
//! We never write to `~/.claude/`; it is only read (auth profile).

use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{Result, StatuslineError};

/// Environment variable overriding the storage root.
pub const HOME_ENV: &str = "STATUSLINE_HOME";

/// Central configuration for all status line storage paths.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory for all status line data (default: ~/.statusline)
    root: PathBuf,
    /// Root directory for Claude Code data (default: ~/.claude)
    claude_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(env::temp_dir);
        let root = env::var_os(HOME_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".statusline"));
        Self {
            root,
            claude_root: home.join(".claude"),
        }
    }
}

impl StorageConfig {
    /// Creates a StorageConfig with a custom root directory.
    /// Used for testing with temp directories.
    pub fn with_root(root: PathBuf) -> Self {
        let claude_root = root.join(".claude");
        Self { root, claude_root }
    }

    /// Creates a StorageConfig with both custom root and claude_root.
    pub fn with_roots(root: PathBuf, claude_root: PathBuf) -> Self {
        Self { root, claude_root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the root directory for Claude Code data.
    pub fn claude_root(&self) -> &Path {
        &self.claude_root
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Global Files
    // ─────────────────────────────────────────────────────────────────────────────

    /// Path to the shared global data cache.
    pub fn global_cache_file(&self) -> PathBuf {
        self.root.join("global-cache.json")
    }

    /// Path to config.toml (user preferences).
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Directories
    // ─────────────────────────────────────────────────────────────────────────────

    /// Per-session scanner state (current schema).
    pub fn scanner_state_dir(&self) -> PathBuf {
        self.root.join("scanner-state")
    }

    /// Older incremental-scanner state (offset/mtime/message count). Read-only.
    pub fn legacy_transcript_state_dir(&self) -> PathBuf {
        self.root.join("transcript-state")
    }

    /// Older secret-scanner state (offset/mtime/findings). Read-only.
    pub fn legacy_secrets_state_dir(&self) -> PathBuf {
        self.root.join("secrets-state")
    }

    /// Per-session merged health records.
    pub fn health_dir(&self) -> PathBuf {
        self.root.join("health")
    }

    /// Single-flight lock files.
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Per-Session Paths
    // ─────────────────────────────────────────────────────────────────────────────

    /// Callers must validate `session_id` before building a path from it.
    pub fn scanner_state_file(&self, session_id: &str) -> PathBuf {
        self.scanner_state_dir().join(format!("{}.json", session_id))
    }

    pub fn health_file(&self, session_id: &str) -> PathBuf {
        self.health_dir().join(format!("{}.json", session_id))
    }

    pub fn lock_file(&self, id: &str) -> PathBuf {
        self.locks_dir().join(format!("{}.lock", id))
    }

    /// `~/.claude.json`, where Claude Code keeps the signed-in account.
    pub fn claude_account_file(&self) -> PathBuf {
        if let Some(dir) = env::var_os("CLAUDE_CONFIG_DIR").filter(|v| !v.is_empty()) {
            return PathBuf::from(dir).join(".claude.json");
        }
        self.claude_root
            .parent()
            .map(|p| p.join(".claude.json"))
            .unwrap_or_else(|| self.claude_root.join(".claude.json"))
    }
}

/// Writes `contents` to `path` via a temp file in the same directory + rename.
///
/// Readers see either the previous file or the new one, never a partial write.
pub(crate) fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs_err::create_dir_all(dir)
        .map_err(|e| StatuslineError::io(format!("creating {}", dir.display()), e))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|e| StatuslineError::io(format!("creating temp file in {}", dir.display()), e))?;
    tmp.write_all(contents)
        .map_err(|e| StatuslineError::io(format!("writing temp file for {}", path.display()), e))?;
    tmp.flush()
        .map_err(|e| StatuslineError::io(format!("flushing temp file for {}", path.display()), e))?;
    tmp.persist(path).map_err(|e| {
        StatuslineError::io(format!("persisting temp file to {}", path.display()), e.error)
    })?;
    Ok(())
}
