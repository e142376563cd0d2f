//! Slash command detection in user-authored text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Extractor, ExtractorOutput, COMMANDS};
use crate::error::ExtractorError;
use crate::scanner::parser::ParsedLine;
use crate::scanner::patterns::{RE_COMMAND_ARGS_TAG, RE_COMMAND_TAG, RE_LEADING_COMMAND};
use crate::scanner::transcript;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEvent {
    /// Including the leading slash, e.g. `/login`.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub line: u64,
    #[serde(default)]
    pub timestamp: i64,
}

pub struct CommandDetector;

impl CommandDetector {
    /// Parses the command (if any) out of one transcript entry.
    pub fn detect(entry: &Value, line: u64) -> Option<CommandEvent> {
        if transcript::entry_type(entry) != Some("user")
            || entry.get("toolUseResult").is_some()
        {
            return None;
        }
        let text = transcript::authored_text(entry)?;
        let (command, args) = parse_command(&text)?;
        Some(CommandEvent {
            command,
            args,
            line,
            timestamp: transcript::timestamp_ms(entry),
        })
    }
}

impl Extractor for CommandDetector {
    fn id(&self) -> &'static str {
        COMMANDS
    }

    fn extract(&self, lines: &[ParsedLine]) -> Result<ExtractorOutput, ExtractorError> {
        let events = lines
            .iter()
            .filter_map(|l| Self::detect(l.data.as_ref()?, l.line_number))
            .collect();
        Ok(ExtractorOutput::Commands(events))
    }

    fn default_output(&self) -> ExtractorOutput {
        ExtractorOutput::Commands(Vec::new())
    }
}

/// Returns `(command, args)` for tagged or leading-slash commands.
pub(crate) fn parse_command(text: &str) -> Option<(String, Vec<String>)> {
    if let Some(caps) = RE_COMMAND_TAG.captures(text) {
        let args = RE_COMMAND_ARGS_TAG
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| tokenize_args(m.as_str()))
            .unwrap_or_default();
        return Some((format!("/{}", &caps[1]), args));
    }

    let first_line = text.trim_start().lines().next()?;
    let caps = RE_LEADING_COMMAND.captures(first_line)?;
    let args = caps
        .get(2)
        .map(|m| tokenize_args(m.as_str()))
        .unwrap_or_default();
    Some((format!("/{}", caps[1].to_ascii_lowercase()), args))
}

/// Whitespace tokenizer that keeps `"quoted strings"` and `'quoted strings'` whole.
pub fn tokenize_args(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;

    for c in input.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}
