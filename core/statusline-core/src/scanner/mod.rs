//! Incremental transcript scanner.
//!
//! One `scan(session_id, path)` call:
//!
//! 1. Load the session's persisted [`ScannerState`] (or start at offset 0)
//! 2. `stat` the transcript; if nothing changed and this process already has a
//!    result, return it
//! 3. Read only the bytes appended since the stored offset
//! 4. Parse them into lines and run every extractor over that window
//! 5. Merge window outputs into the persisted extractor data
//! 6. Save state atomically and memoize the result
//!
//! Bytes already consumed are never read or parsed again unless the file
//! shrinks, which resets the session to a full rescan.

pub mod cache;
pub mod extractors;
pub mod parser;
pub mod patterns;
pub mod reader;
pub mod state;
pub mod transcript;

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::error::{ExtractorError, Result};
use crate::storage::StorageConfig;
use cache::ResultCache;
use extractors::{
    decode_or_default, default_extractors, AuthChange, AuthChangeLog, CommandEvent, Extractor,
    ExtractorOutput, LastMessage, RetentionLimits, Secret,
};
use parser::ParsedLine;
use reader::ReadResult;
use state::{LegacyBaseline, ScannerState, StateManager};

const BUILTIN_KEYS: [&str; 4] = [
    extractors::LAST_MESSAGE,
    extractors::SECRETS,
    extractors::COMMANDS,
    extractors::AUTH_CHANGES,
];

/// Accumulated view of a transcript, as of the latest scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScanResult {
    pub last_message: LastMessage,
    pub secrets: Vec<Secret>,
    pub commands: Vec<CommandEvent>,
    pub auth_changes: Vec<AuthChange>,
    /// Output of extractors beyond the built-in four, keyed by extractor id.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, Value>,
    pub health: TranscriptHealth,
    pub metrics: ScanMetrics,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TranscriptHealth {
    pub exists: bool,
    pub size_bytes: u64,
    /// Transcript mtime, epoch ms.
    pub last_modified: i64,
    /// Completed lines consumed so far.
    pub lines_seen: u64,
    /// When extractors last ran over new bytes, epoch ms.
    pub last_scan_at: i64,
}

/// Per-call counters. Excluded from result equality in tests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScanMetrics {
    pub cache_hit: bool,
    pub full_rescan: bool,
    pub bytes_read: u64,
    pub lines_parsed: u64,
    pub parse_errors: u64,
    pub extractor_failures: u64,
    pub duration_us: u64,
}

pub struct Scanner {
    state: StateManager,
    extractors: Vec<Box<dyn Extractor>>,
    results: ResultCache,
    limits: RetentionLimits,
}

impl Scanner {
    /// Scanner with the built-in extractor set.
    pub fn new(storage: StorageConfig, config: &Config) -> Self {
        Self::with_extractors(storage, config, default_extractors())
    }

    /// Scanner with a caller-chosen extractor set, run in the given order.
    pub fn with_extractors(
        storage: StorageConfig,
        config: &Config,
        extractors: Vec<Box<dyn Extractor>>,
    ) -> Self {
        let ttl = extractors
            .iter()
            .filter_map(|e| e.cache_ttl())
            .fold(config.result_cache_ttl(), Duration::min);
        Self {
            state: StateManager::new(storage),
            extractors,
            results: ResultCache::new(ttl),
            limits: RetentionLimits {
                max_events: config.max_retained_events,
                max_secrets: config.max_retained_secrets,
            },
        }
    }

    pub fn state_manager(&self) -> &StateManager {
        &self.state
    }

    /// Forgets everything about `session_id`; the next scan starts from byte 0.
    pub fn reset(&self, session_id: &str) -> Result<()> {
        self.state.delete(session_id)?;
        self.results.invalidate(session_id);
        Ok(())
    }

    /// Scans whatever was appended to `path` since the last scan of `session_id`.
    ///
    /// Errors only for an invalid session id, a missing transcript, or an
    /// unreadable one. Extractor failures and state-save failures are logged
    /// and absorbed.
    pub fn scan(&self, session_id: &str, path: &Path) -> Result<ScanResult> {
        let started = Instant::now();
        let mut state = self.state.load(session_id)?.unwrap_or_default();
        let read = reader::read_incremental(path, state.last_offset, state.last_mtime)?;

        if read.cache_hit && !read.reset {
            if let Some(mut cached) = self.results.get(session_id) {
                cached.metrics = ScanMetrics {
                    cache_hit: true,
                    duration_us: elapsed_us(started),
                    ..Default::default()
                };
                return Ok(cached);
            }
        }

        if read.reset {
            tracing::info!(
                session = %session_id,
                previous_offset = state.last_offset,
                size = read.size,
                "Transcript shrank; rescanning from the start"
            );
            state = ScannerState::default();
        }

        let reconciled = match state.legacy.take() {
            Some(baseline) => {
                reconcile_legacy(path, &mut state, baseline, &read)?;
                true
            }
            None => false,
        };

        if read.size == 0 {
            return Ok(self.finish_empty(session_id, state, &read, started));
        }

        let consumable = parser::consumable_len(&read.bytes);
        if consumable == 0 {
            // No complete new line: answer from persisted state alone.
            let changed = read.reset || reconciled || state.last_mtime != read.mtime;
            state.last_mtime = read.mtime;
            if changed {
                self.persist(session_id, &state);
            }
            let metrics = ScanMetrics {
                cache_hit: read.cache_hit,
                full_rescan: read.reset,
                duration_us: elapsed_us(started),
                ..Default::default()
            };
            let result = build_result(&state, &BTreeMap::new(), &read, metrics);
            self.results.set(session_id, result.clone());
            return Ok(result);
        }

        let window = &read.bytes[..consumable];
        let lines = parser::parse_lines(window, state.last_line + 1);
        let parse_errors = lines.iter().filter(|l| !l.is_ok()).count() as u64;
        if parse_errors > 0 {
            tracing::debug!(session = %session_id, parse_errors, "Skipped malformed transcript lines");
        }

        let mut transient = BTreeMap::new();
        let mut extractor_failures = 0u64;
        for extractor in &self.extractors {
            let output = match run_extractor(
                extractor.as_ref(),
                &lines,
                state.extractor_data.get(extractor.id()),
            ) {
                Ok(output) => output,
                Err(err) => {
                    extractor_failures += 1;
                    tracing::warn!(session = %session_id, error = %err, "Extractor failed; using default");
                    extractor.default_output()
                }
            };
            let id = extractor.id();
            if extractor.should_cache() {
                let merged = output.merge_into(state.extractor_data.get(id), self.limits);
                state.extractor_data.insert(id.to_string(), merged);
            } else {
                transient.insert(id.to_string(), output.to_value());
            }
        }

        state.last_offset = read.start_offset + consumable as u64;
        state.last_line += parser::count_lines(window);
        state.last_mtime = read.mtime;
        state.last_scan_at = crate::now_ms();
        self.persist(session_id, &state);

        let metrics = ScanMetrics {
            cache_hit: false,
            full_rescan: read.start_offset == 0,
            bytes_read: consumable as u64,
            lines_parsed: lines.len() as u64,
            parse_errors,
            extractor_failures,
            duration_us: elapsed_us(started),
        };
        tracing::debug!(
            session = %session_id,
            bytes = metrics.bytes_read,
            lines = metrics.lines_parsed,
            offset = state.last_offset,
            "Scanned transcript window"
        );

        let result = build_result(&state, &transient, &read, metrics);
        self.results.set(session_id, result.clone());
        Ok(result)
    }

    fn finish_empty(
        &self,
        session_id: &str,
        mut state: ScannerState,
        read: &ReadResult,
        started: Instant,
    ) -> ScanResult {
        let now = crate::now_ms();
        if read.reset || state.last_mtime != read.mtime {
            state.last_mtime = read.mtime;
            state.last_scan_at = now;
            self.persist(session_id, &state);
        }
        let result = ScanResult {
            health: TranscriptHealth {
                exists: true,
                size_bytes: 0,
                last_modified: read.mtime,
                lines_seen: 0,
                last_scan_at: state.last_scan_at,
            },
            metrics: ScanMetrics {
                cache_hit: read.cache_hit && !read.reset,
                full_rescan: read.reset,
                duration_us: elapsed_us(started),
                ..Default::default()
            },
            ..Default::default()
        };
        self.results.set(session_id, result.clone());
        result
    }

    fn persist(&self, session_id: &str, state: &ScannerState) {
        if let Err(e) = self.state.save(session_id, state) {
            tracing::warn!(session = %session_id, error = %e, "Failed to save scanner state");
        }
    }
}

/// Settles migrated state against the transcript: numbers the lines already
/// consumed and takes back turns the legacy count shares with this window.
fn reconcile_legacy(
    path: &Path,
    state: &mut ScannerState,
    baseline: LegacyBaseline,
    read: &ReadResult,
) -> Result<()> {
    state.last_line = reader::count_lines_before(path, state.last_offset)?;

    let overlap = baseline.turns_counted_to.saturating_sub(read.start_offset) as usize;
    let overlap = &read.bytes[..overlap.min(read.bytes.len())];
    let recounted = parser::parse_lines(overlap, 1)
        .iter()
        .filter_map(|l| l.data.as_ref())
        .filter(|e| transcript::is_conversation_entry(e))
        .count() as u64;
    if recounted > 0 {
        let mut last: LastMessage =
            decode_or_default(state.extractor_data.get(extractors::LAST_MESSAGE));
        last.turn_number = last.turn_number.saturating_sub(recounted);
        state
            .extractor_data
            .insert(extractors::LAST_MESSAGE.to_string(), extractors::encode(&last));
    }

    tracing::debug!(
        last_line = state.last_line,
        recounted,
        "Reconciled migrated scanner state"
    );
    Ok(())
}

/// Runs one extractor, converting a panic into an ordinary failure.
fn run_extractor(
    extractor: &dyn Extractor,
    lines: &[ParsedLine],
    prior: Option<&Value>,
) -> std::result::Result<ExtractorOutput, ExtractorError> {
    let attempt = || extractor.extract_continuing(lines, prior);
    match panic::catch_unwind(AssertUnwindSafe(attempt)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panicked".to_string());
            Err(ExtractorError::new(extractor.id(), message))
        }
    }
}

fn build_result(
    state: &ScannerState,
    transient: &BTreeMap<String, Value>,
    read: &ReadResult,
    metrics: ScanMetrics,
) -> ScanResult {
    let lookup = |key: &str| transient.get(key).or_else(|| state.extractor_data.get(key));
    let extras = state
        .extractor_data
        .iter()
        .chain(transient.iter())
        .filter(|(key, _)| !BUILTIN_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    ScanResult {
        last_message: decode_or_default(lookup(extractors::LAST_MESSAGE)),
        secrets: decode_or_default(lookup(extractors::SECRETS)),
        commands: decode_or_default(lookup(extractors::COMMANDS)),
        auth_changes: decode_or_default::<AuthChangeLog>(lookup(extractors::AUTH_CHANGES))
            .changes,
        extras,
        health: TranscriptHealth {
            exists: true,
            size_bytes: read.size,
            last_modified: read.mtime,
            lines_seen: state.last_line,
            last_scan_at: state.last_scan_at,
        },
        metrics,
    }
}

fn elapsed_us(started: Instant) -> u64 {
    started.elapsed().as_micros() as u64
}
