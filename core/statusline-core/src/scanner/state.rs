//! Per-session scanner state, persisted as one JSON file per session.
//!
//! # File Format (v2)
//!
//! ```json
//! {
//!   "version": 2,
//!   "lastOffset": 48213,
//!   "lastMtime": 1735689600000,
//!   "lastScanAt": 1735689600123,
//!   "lastLine": 212,
//!   "extractorData": { "secrets": [...], "last_message": {...} }
//! }
//! ```
//!
//! # Defensive Design
//!
//! - Missing file → one-time migration from the legacy layouts, else absent
//! - Empty, corrupt or wrong-version file → absent (caller rescans from 0)
//!
//! # Atomic Writes
//!
//! Saves go to a uniquely named temp file in the state directory (same
//! filesystem), then rename over the target. A crash before the rename leaves
//! the previous state intact.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;

use super::extractors::{self, encode, fingerprint, LastMessage, Secret};
use crate::error::{validate_identifier, Result, StatuslineError};
use crate::storage::StorageConfig;

pub const SCANNER_STATE_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannerState {
    pub version: u32,
    /// Bytes of the transcript already consumed.
    pub last_offset: u64,
    /// Transcript mtime (epoch ms) at the last scan.
    pub last_mtime: i64,
    pub last_scan_at: i64,
    /// Physical lines consumed, for numbering the next window.
    #[serde(default)]
    pub last_line: u64,
    #[serde(default)]
    pub extractor_data: BTreeMap<String, Value>,
    /// Left by legacy migration until the first scan reconciles it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy: Option<LegacyBaseline>,
}

/// What a legacy layout could not record: line numbers, and how far its
/// turn count already reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyBaseline {
    /// Offset through which the migrated turn count covers the transcript.
    pub turns_counted_to: u64,
}

impl Default for ScannerState {
    fn default() -> Self {
        Self {
            version: SCANNER_STATE_VERSION,
            last_offset: 0,
            last_mtime: 0,
            last_scan_at: 0,
            last_line: 0,
            extractor_data: BTreeMap::new(),
            legacy: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Legacy layouts (read-only)
// ─────────────────────────────────────────────────────────────────────────────

/// Older incremental transcript scanner: offset/mtime/message count.
#[derive(Debug, Deserialize)]
struct LegacyTranscriptState {
    #[serde(alias = "lastOffset", alias = "last_offset")]
    offset: u64,
    #[serde(default, alias = "lastMtime", alias = "last_mtime", alias = "mtimeMs")]
    mtime: f64,
    #[serde(default, alias = "messageCount", alias = "message_count")]
    message_count: u64,
    #[serde(default, alias = "lastScanAt", alias = "last_scan_at")]
    last_scan_at: Option<i64>,
}

/// Older secret scanner: offset/mtime/findings.
#[derive(Debug, Deserialize)]
struct LegacySecretsState {
    #[serde(alias = "lastOffset", alias = "last_offset")]
    offset: u64,
    #[serde(default, alias = "lastMtime", alias = "last_mtime", alias = "mtimeMs")]
    mtime: f64,
    #[serde(default)]
    findings: Vec<LegacyFinding>,
}

#[derive(Debug, Deserialize)]
struct LegacyFinding {
    #[serde(rename = "type", default)]
    secret_type: String,
    #[serde(default)]
    fingerprint: Option<String>,
    #[serde(default)]
    line: u64,
    #[serde(rename = "match", alias = "redacted", alias = "preview", default)]
    redacted: String,
}

fn read_legacy<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let content = fs_err::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable legacy scanner state");
            None
        }
    }
}

/// Owns the state files for every session under one storage root.
#[derive(Debug, Clone)]
pub struct StateManager {
    storage: StorageConfig,
}

impl StateManager {
    pub fn new(storage: StorageConfig) -> Self {
        Self { storage }
    }

    fn state_path(&self, session_id: &str) -> Result<PathBuf> {
        validate_identifier(session_id)?;
        Ok(self.storage.scanner_state_file(session_id))
    }

    /// Loads state for `session_id`, migrating a legacy layout on first sight.
    ///
    /// Only an invalid identifier is an error; everything else degrades to `None`.
    pub fn load(&self, session_id: &str) -> Result<Option<ScannerState>> {
        let path = self.state_path(session_id)?;

        let content = match fs_err::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(self.migrate_legacy(session_id));
            }
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "Failed to read scanner state; rescanning");
                return Ok(None);
            }
        };

        if content.trim().is_empty() {
            tracing::warn!(session = %session_id, "Empty scanner state file; rescanning");
            return Ok(None);
        }

        match serde_json::from_str::<ScannerState>(&content) {
            Ok(state) if state.version == SCANNER_STATE_VERSION => Ok(Some(state)),
            Ok(state) => {
                tracing::warn!(
                    session = %session_id,
                    version = state.version,
                    expected = SCANNER_STATE_VERSION,
                    "Unsupported scanner state version; rescanning"
                );
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "Corrupt scanner state; rescanning");
                Ok(None)
            }
        }
    }

    pub fn save(&self, session_id: &str, state: &ScannerState) -> Result<()> {
        let path = self.state_path(session_id)?;
        let temp = self.write_temp(session_id, state)?;
        temp.persist(&path).map_err(|e| {
            StatuslineError::io(format!("commit scanner state {}", path.display()), e.error)
        })?;
        Ok(())
    }

    /// First half of a save: the fully written temp file, not yet visible.
    pub(crate) fn write_temp(&self, session_id: &str, state: &ScannerState) -> Result<NamedTempFile> {
        validate_identifier(session_id)?;
        let dir = self.storage.scanner_state_dir();
        fs_err::create_dir_all(&dir)
            .map_err(|e| StatuslineError::io("create scanner state dir", e))?;

        let content = serde_json::to_vec_pretty(state)
            .map_err(|e| StatuslineError::json("serialize scanner state", e))?;

        let mut temp = tempfile::Builder::new()
            .prefix(&format!(".{}.", session_id))
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(|e| StatuslineError::io("create temp scanner state", e))?;
        temp.write_all(&content)
            .map_err(|e| StatuslineError::io("write temp scanner state", e))?;
        temp.flush()
            .map_err(|e| StatuslineError::io("flush temp scanner state", e))?;
        Ok(temp)
    }

    pub fn delete(&self, session_id: &str) -> Result<()> {
        let path = self.state_path(session_id)?;
        match fs_err::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StatuslineError::io("delete scanner state", e)),
        }
    }

    /// Session ids with persisted state, sorted.
    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = fs_err::read_dir(self.storage.scanner_state_dir()) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|e| e == "json"))
            .filter_map(|path| path.file_stem()?.to_str().map(str::to_string))
            .filter(|id| validate_identifier(id).is_ok())
            .collect();
        ids.sort();
        ids
    }

    /// Builds v2 state from whichever legacy files exist and persists it, so
    /// migration runs at most once per session.
    fn migrate_legacy(&self, session_id: &str) -> Option<ScannerState> {
        let file = format!("{}.json", session_id);
        let transcript: Option<LegacyTranscriptState> =
            read_legacy(&self.storage.legacy_transcript_state_dir().join(&file));
        let secrets: Option<LegacySecretsState> =
            read_legacy(&self.storage.legacy_secrets_state_dir().join(&file));

        let state = migrate(transcript, secrets)?;
        tracing::info!(
            session = %session_id,
            offset = state.last_offset,
            "Migrated legacy scanner state"
        );
        if let Err(e) = self.save(session_id, &state) {
            tracing::warn!(session = %session_id, error = %e, "Failed to persist migrated scanner state");
        }
        Some(state)
    }
}

/// Maps the legacy layouts onto v2. With both present, the smaller offset wins
/// so neither scanner's unseen bytes are skipped; secrets dedupe by fingerprint.
///
/// Line numbers and the turn overlap need the transcript itself, so the
/// result carries a [`LegacyBaseline`] for the first scan to settle.
fn migrate(
    transcript: Option<LegacyTranscriptState>,
    secrets: Option<LegacySecretsState>,
) -> Option<ScannerState> {
    if transcript.is_none() && secrets.is_none() {
        return None;
    }

    let mut state = ScannerState::default();
    let mut offsets: Vec<(u64, i64)> = Vec::new();
    let mut turns_counted_to = 0;

    if let Some(legacy) = &transcript {
        turns_counted_to = legacy.offset;
        offsets.push((legacy.offset, legacy.mtime as i64));
        state.last_scan_at = legacy.last_scan_at.unwrap_or(0);
        let last_message = LastMessage {
            turn_number: legacy.message_count,
            ..LastMessage::default()
        };
        state
            .extractor_data
            .insert(extractors::LAST_MESSAGE.to_string(), encode(&last_message));
    }

    if let Some(legacy) = secrets {
        offsets.push((legacy.offset, legacy.mtime as i64));
        let mut migrated: Vec<Secret> = Vec::new();
        for finding in legacy.findings {
            // Old findings only kept the redacted form; hash that when no
            // fingerprint was recorded.
            let fp = finding.fingerprint.unwrap_or_else(|| {
                fingerprint(&format!("{}:{}", finding.secret_type, finding.redacted))
            });
            if migrated.iter().any(|s| s.fingerprint == fp) {
                continue;
            }
            migrated.push(Secret {
                secret_type: finding.secret_type,
                fingerprint: fp,
                line: finding.line,
                redacted: finding.redacted,
            });
        }
        state
            .extractor_data
            .insert(extractors::SECRETS.to_string(), encode(&migrated));
    }

    if let Some((offset, mtime)) = offsets.into_iter().min_by_key(|(offset, _)| *offset) {
        state.last_offset = offset;
        state.last_mtime = mtime;
    }
    state.legacy = Some(LegacyBaseline { turns_counted_to });
    Some(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(root: &Path) -> StateManager {
        StateManager::new(StorageConfig::with_root(root.to_path_buf()))
    }

    fn sample_state(offset: u64) -> ScannerState {
        ScannerState {
            last_offset: offset,
            last_mtime: 42,
            last_scan_at: 7,
            last_line: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_round_trip_and_camel_case_on_disk() {
        let temp = tempdir().unwrap();
        let mgr = manager(temp.path());
        mgr.save("s1", &sample_state(100)).unwrap();

        assert_eq!(mgr.load("s1").unwrap(), Some(sample_state(100)));
        let raw = fs_err::read_to_string(temp.path().join("scanner-state/s1.json")).unwrap();
        assert!(raw.contains("\"lastOffset\": 100"));
        assert!(raw.contains("\"version\": 2"));
    }

    #[test]
    fn test_missing_state_is_none() {
        let temp = tempdir().unwrap();
        assert_eq!(manager(temp.path()).load("nobody").unwrap(), None);
    }

    #[test]
    fn test_invalid_identifier_rejected_everywhere() {
        let temp = tempdir().unwrap();
        let mgr = manager(temp.path());
        assert!(matches!(
            mgr.load("../escape"),
            Err(StatuslineError::InvalidIdentifier(_))
        ));
        assert!(mgr.save("a/b", &ScannerState::default()).is_err());
        assert!(mgr.delete("..").is_err());
    }

    #[test]
    fn test_corrupt_and_wrong_version_are_absent() {
        let temp = tempdir().unwrap();
        let mgr = manager(temp.path());
        let dir = temp.path().join("scanner-state");
        fs_err::create_dir_all(&dir).unwrap();

        fs_err::write(dir.join("bad.json"), "{not json").unwrap();
        assert_eq!(mgr.load("bad").unwrap(), None);

        fs_err::write(dir.join("empty.json"), "  ").unwrap();
        assert_eq!(mgr.load("empty").unwrap(), None);

        fs_err::write(
            dir.join("old.json"),
            r#"{"version":1,"lastOffset":1,"lastMtime":1,"lastScanAt":1}"#,
        )
        .unwrap();
        assert_eq!(mgr.load("old").unwrap(), None);
    }

    #[test]
    fn test_crash_before_rename_keeps_previous_state() {
        let temp = tempdir().unwrap();
        let mgr = manager(temp.path());
        mgr.save("s1", &sample_state(10)).unwrap();

        // Simulate a crash after the temp write but before the rename.
        let temp_file = mgr.write_temp("s1", &sample_state(999)).unwrap();
        let (_, leftover) = temp_file.keep().unwrap();
        assert!(leftover.exists());

        assert_eq!(mgr.load("s1").unwrap(), Some(sample_state(10)));
        assert_eq!(mgr.list(), vec!["s1".to_string()]);
    }

    #[test]
    fn test_delete_and_list() {
        let temp = tempdir().unwrap();
        let mgr = manager(temp.path());
        assert!(mgr.list().is_empty());

        mgr.save("b", &sample_state(1)).unwrap();
        mgr.save("a", &sample_state(2)).unwrap();
        assert_eq!(mgr.list(), vec!["a".to_string(), "b".to_string()]);

        mgr.delete("a").unwrap();
        mgr.delete("a").unwrap();
        assert_eq!(mgr.list(), vec!["b".to_string()]);
    }

    #[test]
    fn test_migrates_transcript_legacy_once() {
        let temp = tempdir().unwrap();
        let mgr = manager(temp.path());
        let legacy_dir = temp.path().join("transcript-state");
        fs_err::create_dir_all(&legacy_dir).unwrap();
        fs_err::write(
            legacy_dir.join("s1.json"),
            r#"{"lastOffset": 500, "lastMtime": 1700000000000.5, "messageCount": 12}"#,
        )
        .unwrap();

        let state = mgr.load("s1").unwrap().unwrap();
        assert_eq!(state.last_offset, 500);
        assert_eq!(state.last_mtime, 1_700_000_000_000);
        let last: LastMessage =
            extractors::decode_or_default(state.extractor_data.get(extractors::LAST_MESSAGE));
        assert_eq!(last.turn_number, 12);

        // Persisted in the new layout, so the legacy file is not consulted again.
        assert!(temp.path().join("scanner-state/s1.json").exists());
        fs_err::remove_file(legacy_dir.join("s1.json")).unwrap();
        assert_eq!(mgr.load("s1").unwrap(), Some(state));
    }

    #[test]
    fn test_migrates_both_legacy_layouts_using_smaller_offset() {
        let temp = tempdir().unwrap();
        let mgr = manager(temp.path());
        for dir in ["transcript-state", "secrets-state"] {
            fs_err::create_dir_all(temp.path().join(dir)).unwrap();
        }
        fs_err::write(
            temp.path().join("transcript-state/s2.json"),
            r#"{"offset": 900, "mtime": 5, "messageCount": 3}"#,
        )
        .unwrap();
        fs_err::write(
            temp.path().join("secrets-state/s2.json"),
            r#"{"offset": 400, "mtime": 4, "findings": [
                {"type": "GitHub Token", "line": 2, "match": "ghp_...abcd"},
                {"type": "GitHub Token", "line": 9, "match": "ghp_...abcd"}
            ]}"#,
        )
        .unwrap();

        let state = mgr.load("s2").unwrap().unwrap();
        assert_eq!(state.last_offset, 400);
        assert_eq!(state.last_mtime, 4);
        assert_eq!(state.last_line, 0);
        assert_eq!(
            state.legacy,
            Some(LegacyBaseline {
                turns_counted_to: 900
            })
        );
        let secrets: Vec<Secret> =
            extractors::decode_or_default(state.extractor_data.get(extractors::SECRETS));
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].redacted, "ghp_...abcd");
    }
}
