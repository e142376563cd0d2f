//! Accessors for Claude Code transcript entries.
//!
//! Entries look like:
//!
//! ```json
//! {"type":"user","timestamp":"2025-01-01T00:00:00Z",
//!  "message":{"role":"user","content":"hi" | [{"type":"text","text":"hi"}, ...]}}
//! ```
//!
//! Everything here is lenient: unknown shapes yield `None`, never an error.

use serde_json::Value;

/// Prefixes Claude Code injects into user entries that the human did not type.
const SYSTEM_PREFIXES: &[&str] = &[
    "<local-command-stdout>",
    "<local-command-stderr>",
    "<local-command-caveat>",
    "<system-reminder>",
    "<task-notification>",
    "<command-name>",
    "<command-message>",
    "Caveat:",
];

pub fn entry_type(entry: &Value) -> Option<&str> {
    entry.get("type").and_then(Value::as_str)
}

pub fn is_conversation_entry(entry: &Value) -> bool {
    matches!(entry_type(entry), Some("user") | Some("assistant"))
}

/// Entry timestamp in epoch milliseconds, or 0.
pub fn timestamp_ms(entry: &Value) -> i64 {
    match entry.get("timestamp") {
        Some(Value::String(s)) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(0),
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        _ => 0,
    }
}

fn content(entry: &Value) -> Option<&Value> {
    entry
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| entry.get("content"))
}

/// Text the author wrote: string content or `text` blocks, joined by newlines.
pub fn authored_text(entry: &Value) -> Option<String> {
    match content(entry)? {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let texts: Vec<&str> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            }
        }
        _ => None,
    }
}

/// All visible text, including tool results and command output.
pub fn visible_text(entry: &Value) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(Value::Array(blocks)) = content(entry) {
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(Value::as_str) {
                        parts.push(t.to_string());
                    }
                }
                Some("tool_result") => match block.get("content") {
                    Some(Value::String(s)) => parts.push(s.clone()),
                    Some(Value::Array(inner)) => parts.extend(
                        inner
                            .iter()
                            .filter_map(|b| b.get("text").and_then(Value::as_str))
                            .map(str::to_string),
                    ),
                    _ => {}
                },
                _ => {}
            }
        }
    } else if let Some(Value::String(s)) = content(entry) {
        parts.push(s.clone());
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

/// A user entry the human actually typed (not meta, tool results, or command output).
pub fn is_human_authored(entry: &Value) -> bool {
    if entry_type(entry) != Some("user") {
        return false;
    }
    if entry.get("isMeta").and_then(Value::as_bool).unwrap_or(false)
        || entry.get("toolUseResult").is_some()
    {
        return false;
    }
    match authored_text(entry) {
        Some(text) => {
            let trimmed = text.trim_start();
            !trimmed.is_empty() && !SYSTEM_PREFIXES.iter().any(|p| trimmed.starts_with(p))
        }
        None => false,
    }
}

/// Every string leaf in `value`, newline-joined. Object string fields render as
/// `key: value` so assignment-style patterns still see the key.
pub fn flatten_strings(value: &Value) -> String {
    fn walk(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) => out.push(s.clone()),
            Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
            Value::Object(map) => {
                for (key, v) in map {
                    match v {
                        Value::String(s) => out.push(format!("{}: {}", key, s)),
                        other => walk(other, out),
                    }
                }
            }
            _ => {}
        }
    }
    let mut out = Vec::new();
    walk(value, &mut out);
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_authored_text_string_and_blocks() {
        let a = json!({"type":"user","message":{"content":"hello"}});
        assert_eq!(authored_text(&a).as_deref(), Some("hello"));

        let b = json!({"type":"user","message":{"content":[
            {"type":"text","text":"one"},{"type":"image"},{"type":"text","text":"two"}
        ]}});
        assert_eq!(authored_text(&b).as_deref(), Some("one\ntwo"));
    }

    #[test]
    fn test_tool_result_is_not_human_authored() {
        let entry = json!({"type":"user","message":{"content":[
            {"type":"tool_result","content":"output"}
        ]}});
        assert!(!is_human_authored(&entry));
        assert_eq!(visible_text(&entry).as_deref(), Some("output"));
    }

    #[test]
    fn test_command_stdout_is_not_human_authored() {
        let entry = json!({"type":"user","message":{"content":
            "<local-command-stdout>Login successful</local-command-stdout>"}});
        assert!(!is_human_authored(&entry));
    }

    #[test]
    fn test_slash_command_markup_is_not_human_authored() {
        for content in [
            "<command-name>/model</command-name><command-args>opus</command-args>",
            "<command-message>model</command-message>\n<command-name>/model</command-name>",
        ] {
            let entry = json!({"type":"user","message":{"content": content}});
            assert!(!is_human_authored(&entry));
        }
    }

    #[test]
    fn test_meta_is_not_human_authored() {
        let entry = json!({"type":"user","isMeta":true,"message":{"content":"x"}});
        assert!(!is_human_authored(&entry));
    }

    #[test]
    fn test_timestamp_parsing() {
        let entry = json!({"timestamp":"1970-01-01T00:00:01.500Z"});
        assert_eq!(timestamp_ms(&entry), 1500);
        assert_eq!(timestamp_ms(&json!({})), 0);
    }

    #[test]
    fn test_flatten_strings_keeps_string_field_keys() {
        let v = json!({"api_key":"value1","nested":[{"x":"value2"}, 3, "bare"]});
        let flat = flatten_strings(&v);
        assert!(flat.contains("api_key: value1"));
        assert!(flat.contains("x: value2"));
        assert!(flat.lines().any(|l| l == "bare"));
        assert!(!flat.contains("nested"));
    }
}
