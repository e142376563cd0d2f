//! Confirmed account changes (`/login`, `/logout`, account swaps).
//!
//! An auth command only counts once a success message shows up within the next
//! [`AUTH_LOOKAHEAD_LINES`] lines. Unconfirmed attempts are ignored. A command
//! near the end of a window stays pending, with what is left of its lookahead
//! budget, and is resolved against the next window.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::commands::parse_command;
use super::{decode_or_default, Extractor, ExtractorOutput, AUTH_CHANGES};
use crate::error::ExtractorError;
use crate::scanner::parser::ParsedLine;
use crate::scanner::patterns::{AUTH_CONFIRMATIONS, RE_EMAIL};
use crate::scanner::transcript;

pub const AUTH_LOOKAHEAD_LINES: usize = 10;

const AUTH_COMMANDS: &[&str] = &[
    "/login",
    "/logout",
    "/swap-auth",
    "/switch-account",
    "/auth",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChange {
    pub command: String,
    /// Account identifier from the confirmation, usually an email.
    #[serde(default)]
    pub account: Option<String>,
    pub line: u64,
    /// Line number of the confirmation message.
    pub confirmed_at_line: u64,
    #[serde(default)]
    pub timestamp: i64,
}

pub struct AuthChangeDetector;

impl AuthChangeDetector {
    fn auth_command(line: &ParsedLine) -> Option<String> {
        let entry = line.data.as_ref()?;
        if transcript::entry_type(entry) != Some("user") {
            return None;
        }
        let text = transcript::authored_text(entry)?;
        let (command, _) = parse_command(&text)?;
        AUTH_COMMANDS.contains(&command.as_str()).then_some(command)
    }

    /// Returns the account (if any) when `line` confirms an auth change.
    fn confirmation(line: &ParsedLine) -> Option<Option<String>> {
        let text = line
            .data
            .as_ref()
            .and_then(transcript::visible_text)
            .unwrap_or_else(|| line.raw.clone());
        for re in AUTH_CONFIRMATIONS.iter() {
            if let Some(caps) = re.captures(&text) {
                let account = RE_EMAIL
                    .find(&text)
                    .map(|m| m.as_str().to_string())
                    .or_else(|| {
                        caps.get(1).map(|m| {
                            m.as_str()
                                .trim_end_matches(|c: char| ".,;:!)".contains(c))
                                .to_string()
                        })
                    });
                return Some(account);
            }
        }
        None
    }
}

/// An auth command still waiting for its confirmation when a window ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAuth {
    pub command: String,
    pub line: u64,
    /// Lines left in the lookahead budget.
    pub remaining: usize,
}

/// Persisted form: confirmed changes plus commands carried into the next window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthChangeLog {
    pub changes: Vec<AuthChange>,
    pub pending: Vec<PendingAuth>,
}

impl AuthChangeDetector {
    /// First confirmation among `candidates`, as a finished change.
    fn confirm<'a>(
        command: &str,
        line: u64,
        candidates: impl Iterator<Item = &'a ParsedLine>,
    ) -> Option<AuthChange> {
        for candidate in candidates {
            if let Some(account) = Self::confirmation(candidate) {
                return Some(AuthChange {
                    command: command.to_string(),
                    account,
                    line,
                    confirmed_at_line: candidate.line_number,
                    timestamp: candidate
                        .data
                        .as_ref()
                        .map(transcript::timestamp_ms)
                        .unwrap_or(0),
                });
            }
        }
        None
    }

    /// Resolves `carried` commands against the head of `lines`, then detects
    /// new commands. Unconfirmed commands whose budget outlives the window
    /// come back as pending.
    fn detect(lines: &[ParsedLine], carried: Vec<PendingAuth>) -> ExtractorOutput {
        let mut changes = Vec::new();
        let mut pending = Vec::new();

        for prior in carried {
            let window = lines.iter().take(prior.remaining);
            match Self::confirm(&prior.command, prior.line, window) {
                Some(change) => changes.push(change),
                None if prior.remaining > lines.len() => pending.push(PendingAuth {
                    remaining: prior.remaining - lines.len(),
                    ..prior
                }),
                None => {}
            }
        }

        for (idx, line) in lines.iter().enumerate() {
            let Some(command) = Self::auth_command(line) else {
                continue;
            };
            let window = lines.iter().skip(idx + 1).take(AUTH_LOOKAHEAD_LINES);
            match Self::confirm(&command, line.line_number, window) {
                Some(change) => changes.push(change),
                None => {
                    let seen = lines.len() - idx - 1;
                    if seen < AUTH_LOOKAHEAD_LINES {
                        pending.push(PendingAuth {
                            command,
                            line: line.line_number,
                            remaining: AUTH_LOOKAHEAD_LINES - seen,
                        });
                    }
                }
            }
        }

        ExtractorOutput::AuthChanges { changes, pending }
    }
}

impl Extractor for AuthChangeDetector {
    fn id(&self) -> &'static str {
        AUTH_CHANGES
    }

    fn extract(&self, lines: &[ParsedLine]) -> Result<ExtractorOutput, ExtractorError> {
        Ok(Self::detect(lines, Vec::new()))
    }

    fn extract_continuing(
        &self,
        lines: &[ParsedLine],
        prior: Option<&Value>,
    ) -> Result<ExtractorOutput, ExtractorError> {
        let log: AuthChangeLog = decode_or_default(prior);
        Ok(Self::detect(lines, log.pending))
    }

    fn default_output(&self) -> ExtractorOutput {
        ExtractorOutput::AuthChanges {
            changes: Vec::new(),
            pending: Vec::new(),
        }
    }
}
