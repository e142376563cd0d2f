//! Compiled regex patterns for transcript extraction.
//!
//! Compiled once on first use. Update these when Claude Code's transcript
//! format or provider token formats change.

use once_cell::sync::Lazy;
use regex::Regex;

// ═══════════════════════════════════════════════════════════════════════════════
// Secret Detection
// ═══════════════════════════════════════════════════════════════════════════════

/// One entry in the ordered secret pattern table.
pub struct SecretPattern {
    /// Label reported as the secret's `type`.
    pub label: &'static str,
    pub regex: Regex,
    /// Capture group holding the secret value (0 = whole match).
    pub group: usize,
}

impl SecretPattern {
    fn new(label: &'static str, pattern: &str, group: usize) -> Self {
        Self {
            label,
            regex: Regex::new(pattern).unwrap(),
            group,
        }
    }
}

/// Ordered: earlier patterns win when two report the same value.
pub static SECRET_PATTERNS: Lazy<Vec<SecretPattern>> = Lazy::new(|| {
    vec![
        SecretPattern::new("GitHub Token", r"\b(?:ghp|gho|ghu|ghs|ghr)_[A-Za-z0-9]{36,}\b", 0),
        SecretPattern::new("GitHub Token", r"\bgithub_pat_[A-Za-z0-9_]{22,}\b", 0),
        SecretPattern::new("Anthropic API Key", r"\bsk-ant-[A-Za-z0-9_\-]{20,}", 0),
        SecretPattern::new("OpenAI API Key", r"\bsk-(?:proj-)?[A-Za-z0-9]{20,}\b", 0),
        SecretPattern::new("AWS Access Key", r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b", 0),
        SecretPattern::new("Slack Token", r"\bxox[abprs]-[A-Za-z0-9\-]{10,}", 0),
        SecretPattern::new("Stripe Key", r"\b(?:sk|rk)_live_[A-Za-z0-9]{20,}\b", 0),
        SecretPattern::new("Google API Key", r"\bAIza[0-9A-Za-z_\-]{35}", 0),
        SecretPattern::new(
            "Private Key",
            r"-----BEGIN (?:RSA |EC |DSA |OPENSSH |ENCRYPTED )?PRIVATE KEY-----(?:[\s\S]*?-----END (?:RSA |EC |DSA |OPENSSH |ENCRYPTED )?PRIVATE KEY-----)?",
            0,
        ),
        SecretPattern::new(
            "Generic API Key",
            r#"(?i)\b(?:api[_-]?key|api[_-]?secret|access[_-]?token|auth[_-]?token|secret[_-]?key|client[_-]?secret|password)["']?\s*[:=]\s*["']?([A-Za-z0-9_\-+/.]{16,})"#,
            1,
        ),
    ]
});

// ═══════════════════════════════════════════════════════════════════════════════
// Command Detection
// ═══════════════════════════════════════════════════════════════════════════════

/// Claude Code records slash commands as `<command-name>/x</command-name>`.
pub static RE_COMMAND_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<command-name>\s*/?([A-Za-z][\w:\-]*)\s*</command-name>").unwrap());
pub static RE_COMMAND_ARGS_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<command-args>(.*?)</command-args>").unwrap());

/// A command typed at the start of a message. The token must be followed by
/// whitespace or end of text, so `/usr/bin is ...` never matches. Arguments
/// stop at sentence punctuation or a conjunction that starts prose.
pub static RE_LEADING_COMMAND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*/([a-z][\w:\-]*)(?:[ \t]+(.*?))?[ \t]*(?:$|[.!?;](?:\s|$)|\s+(?:and|then|but|so|because|which|to|if)\s)",
    )
    .unwrap()
});

// ═══════════════════════════════════════════════════════════════════════════════
// Auth Change Detection
// ═══════════════════════════════════════════════════════════════════════════════

/// Phrasings Claude Code (and the account swap helpers) print on success.
pub static AUTH_CONFIRMATIONS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)login successful",
        r"(?i)successfully logged in(?: as ([^\s<]+))?",
        r"(?i)logged in as ([^\s<]+)",
        r"(?i)switched (?:to )?account(?: to)?:? ([^\s<]+)",
        r"(?i)authenticated as ([^\s<]+)",
        r"(?i)successfully logged out",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

pub static RE_EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(?:\.[A-Za-z0-9\-]+)+").unwrap());

// ═══════════════════════════════════════════════════════════════════════════════
// Text Normalization
// ═══════════════════════════════════════════════════════════════════════════════

pub static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_patterns_compile() {
        assert!(SECRET_PATTERNS.len() >= 10);
        assert!(!AUTH_CONFIRMATIONS.is_empty());
        assert!(RE_LEADING_COMMAND.is_match("/login"));
    }

    #[test]
    fn test_leading_command_ignores_paths() {
        assert!(!RE_LEADING_COMMAND.is_match("/usr/bin is where it lives"));
        assert!(RE_LEADING_COMMAND.is_match("/model opus"));
    }
}
