//! Most recent human-authored message in a window.

use serde::{Deserialize, Serialize};

use super::{Extractor, ExtractorOutput, LAST_MESSAGE};
use crate::error::ExtractorError;
use crate::scanner::parser::ParsedLine;
use crate::scanner::patterns::RE_WHITESPACE;
use crate::scanner::transcript;

pub const PREVIEW_MAX_CHARS: usize = 80;
const TRUNCATION_MARKER: &str = "..";
const UNKNOWN_SENDER: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LastMessage {
    /// Epoch milliseconds; 0 when no message was found.
    pub timestamp: i64,
    pub preview: String,
    pub sender: String,
    /// Count of user + assistant entries, matched or not.
    pub turn_number: u64,
}

impl Default for LastMessage {
    fn default() -> Self {
        Self {
            timestamp: 0,
            preview: String::new(),
            sender: UNKNOWN_SENDER.to_string(),
            turn_number: 0,
        }
    }
}

impl LastMessage {
    pub fn is_found(&self) -> bool {
        self.sender != UNKNOWN_SENDER
    }
}

pub struct LastMessageExtractor;

impl Extractor for LastMessageExtractor {
    fn id(&self) -> &'static str {
        LAST_MESSAGE
    }

    fn extract(&self, lines: &[ParsedLine]) -> Result<ExtractorOutput, ExtractorError> {
        let entries: Vec<_> = lines.iter().filter_map(|l| l.data.as_ref()).collect();
        let turn_number = entries
            .iter()
            .filter(|e| transcript::is_conversation_entry(e))
            .count() as u64;

        let found = entries
            .iter()
            .rev()
            .find(|e| transcript::is_human_authored(e))
            .and_then(|entry| {
                let text = transcript::authored_text(entry)?;
                Some(LastMessage {
                    timestamp: transcript::timestamp_ms(entry),
                    preview: preview(&text),
                    sender: "user".to_string(),
                    turn_number,
                })
            });

        Ok(ExtractorOutput::LastMessage(found.unwrap_or(LastMessage {
            turn_number,
            ..LastMessage::default()
        })))
    }

    fn default_output(&self) -> ExtractorOutput {
        ExtractorOutput::LastMessage(LastMessage::default())
    }
}

/// Collapses whitespace and truncates to [`PREVIEW_MAX_CHARS`] with a ".." marker.
pub fn preview(text: &str) -> String {
    let collapsed = RE_WHITESPACE.replace_all(text.trim(), " ");
    if collapsed.chars().count() <= PREVIEW_MAX_CHARS {
        return collapsed.into_owned();
    }
    let keep = PREVIEW_MAX_CHARS - TRUNCATION_MARKER.len();
    let mut out: String = collapsed.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}
