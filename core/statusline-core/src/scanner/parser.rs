//! JSONL line parsing, tolerant of malformed and partially flushed lines.

use serde_json::Value;

/// One physical transcript line. Lives only for the duration of a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    /// 1-based line number within the transcript.
    pub line_number: u64,
    pub raw: String,
    pub data: Option<Value>,
    pub parse_error: Option<String>,
}

impl ParsedLine {
    pub fn is_ok(&self) -> bool {
        self.data.is_some()
    }
}

/// Splits `bytes` on newlines and decodes each non-blank line as JSON.
///
/// Decode failures become a `ParsedLine` with `parse_error` set; nothing here
/// ever fails. Blank lines are skipped but still advance the line number.
pub fn parse_lines(bytes: &[u8], start_line_number: u64) -> Vec<ParsedLine> {
    let mut lines = Vec::new();
    for (idx, segment) in bytes.split(|b| *b == b'\n').enumerate() {
        let segment = segment.strip_suffix(b"\r").unwrap_or(segment);
        if segment.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        let raw = String::from_utf8_lossy(segment).into_owned();
        let (data, parse_error) = match serde_json::from_slice::<Value>(segment) {
            Ok(value) => (Some(value), None),
            Err(e) => (None, Some(e.to_string())),
        };
        lines.push(ParsedLine {
            line_number: start_line_number + idx as u64,
            raw,
            data,
            parse_error,
        });
    }
    lines
}

/// Number of leading bytes of `bytes` that are safe to consume now.
///
/// A trailing segment without a newline is held back if it does not decode as
/// JSON yet: the writer is most likely still flushing it.
pub fn consumable_len(bytes: &[u8]) -> usize {
    if bytes.last() == Some(&b'\n') {
        return bytes.len();
    }
    let tail_start = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    let tail = &bytes[tail_start..];
    if tail.iter().all(|b| b.is_ascii_whitespace()) || serde_json::from_slice::<Value>(tail).is_ok()
    {
        bytes.len()
    } else {
        tail_start
    }
}

/// Completed lines in `bytes`.
///
/// An unterminated tail is not counted: the next chunk starts with the rest of
/// that same physical line, so numbering resumes at `count + 1` either way.
pub fn count_lines(bytes: &[u8]) -> u64 {
    bytes.iter().filter(|b| **b == b'\n').count() as u64
}
