//! Error types for statusline-core operations.
//!
//! Only a handful of these ever reach the top-level caller. Most are caught at
//! a component boundary and turned into "no data this round".

use std::path::PathBuf;

/// All errors that can occur in statusline-core operations.
#[derive(Debug, thiserror::Error)]
pub enum StatuslineError {
    // ─────────────────────────────────────────────────────────────────────
    // Input Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid identifier: {0:?} (expected [A-Za-z0-9_-]+)")]
    InvalidIdentifier(String),

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration malformed: {path}: {details}")]
    Config { path: PathBuf, details: String },

    #[error("Data source registration rejected: {0}")]
    Registry(String),
}

impl StatuslineError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StatuslineError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        StatuslineError::Json {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using StatuslineError.
pub type Result<T> = std::result::Result<T, StatuslineError>;

/// Failure of a single extractor. Never escapes the scanner.
#[derive(Debug, Clone, thiserror::Error)]
#[error("extractor {extractor} failed: {message}")]
pub struct ExtractorError {
    pub extractor: String,
    pub message: String,
}

impl ExtractorError {
    pub fn new(extractor: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            extractor: extractor.into(),
            message: message.into(),
        }
    }
}

/// Failure of a data source fetch. The broker skips that source's merge.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("fetch failed: {0}")]
    Failed(String),

    #[error("fetch timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("gather deadline already passed")]
    DeadlineExceeded,

    #[error("fetch produced a value of the wrong shape: {0}")]
    Shape(String),
}

impl From<StatuslineError> for FetchError {
    fn from(err: StatuslineError) -> Self {
        FetchError::Failed(err.to_string())
    }
}

/// Validates an identifier that will be interpolated into a file path.
pub fn validate_identifier(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(StatuslineError::InvalidIdentifier(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_accepts_uuid_like_ids() {
        assert!(validate_identifier("0f3c2a1e-aaaa-bbbb-cccc-1234567890ab").is_ok());
        assert!(validate_identifier("session_1").is_ok());
    }

    #[test]
    fn test_validate_identifier_rejects_traversal() {
        for bad in ["", "../etc", "a/b", "a.b", "a b", "sess\u{e9}"] {
            assert!(
                matches!(
                    validate_identifier(bad),
                    Err(StatuslineError::InvalidIdentifier(_))
                ),
                "{bad:?} should be rejected"
            );
        }
    }
}
