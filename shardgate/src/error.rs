//! Router error types and the client-facing error document

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while routing an operation
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouterError {
    /// The metadata store could not be reached or answered with garbage
    #[error("db config reload failed: {0}")]
    ConfigUnavailable(String),

    /// A namespace is marked partitioned but has no partition directory
    #[error("no shard info for: {0}")]
    NoShardInfo(String),

    #[error("no primary shard for: {0}")]
    NoPrimaryShard(String),

    /// A shard reported that it does not own the targeted range
    #[error("stale config for {ns}: {reason}")]
    StaleConfig { ns: String, reason: String },

    #[error("too many attempts to update config, failing ({attempts} attempts for {ns})")]
    TooManyRetries { ns: String, attempts: u32 },

    /// A multi-shard write went stale after other shards applied their part
    #[error("write to {ns} partially applied on {applied:?}: {reason}")]
    PartialWrite {
        ns: String,
        applied: Vec<String>,
        reason: String,
    },

    /// The caller asked an ill-formed routing question
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("shard not found: {0}")]
    ShardNotFound(String),

    #[error("inconsistent partition directory: {0}")]
    InconsistentDirectory(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl RouterError {
    /// Stable numeric code surfaced to clients
    pub fn code(&self) -> i32 {
        match self {
            RouterError::ConfigUnavailable(_) => 10192,
            RouterError::NoShardInfo(_) => 10193,
            RouterError::NoPrimaryShard(_) => 10194,
            RouterError::TooManyRetries { .. } => 10195,
            RouterError::PartialWrite { .. } => 10197,
            RouterError::InvalidOperation(_) => 8060,
            RouterError::ProtocolViolation(_) => 13134,
            RouterError::StaleConfig { .. } => 9996,
            RouterError::Transport(_) => 9001,
            RouterError::ShardNotFound(_) => 10181,
            RouterError::InconsistentDirectory(_) => 10198,
            RouterError::Config(_) => 14,
        }
    }

    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            RouterError::ConfigUnavailable(_) => "config_unavailable",
            RouterError::NoShardInfo(_) => "no_shard_info",
            RouterError::NoPrimaryShard(_) => "no_primary_shard",
            RouterError::StaleConfig { .. } => "stale_config",
            RouterError::TooManyRetries { .. } => "too_many_retries",
            RouterError::PartialWrite { .. } => "partial_write",
            RouterError::InvalidOperation(_) => "invalid_operation",
            RouterError::ProtocolViolation(_) => "protocol_violation",
            RouterError::ShardNotFound(_) => "shard_not_found",
            RouterError::InconsistentDirectory(_) => "inconsistent_directory",
            RouterError::Transport(_) => "transport",
            RouterError::Config(_) => "config",
        }
    }

    /// Whether the router recovers from this error by reloading and retrying
    pub fn is_stale_config(&self) -> bool {
        matches!(self, RouterError::StaleConfig { .. })
    }
}

/// Structured failure returned to a client instead of closing its connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDocument {
    #[serde(rename = "$err")]
    pub err: String,
    pub code: i32,
}

impl From<&RouterError> for ErrorDocument {
    fn from(err: &RouterError) -> Self {
        Self {
            err: err.to_string(),
            code: err.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_document_shape() {
        let err = RouterError::TooManyRetries {
            ns: "test.foo".into(),
            attempts: 5,
        };
        let doc = ErrorDocument::from(&err);
        assert_eq!(doc.code, 10195);

        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["code"], 10195);
        assert!(json["$err"].as_str().unwrap().contains("too many attempts"));
    }

    #[test]
    fn test_only_stale_config_is_retryable() {
        let stale = RouterError::StaleConfig {
            ns: "a.b".into(),
            reason: "not my range".into(),
        };
        assert!(stale.is_stale_config());
        assert!(!RouterError::Transport("down".into()).is_stale_config());
        assert_eq!(RouterError::ProtocolViolation("x".into()).code(), 13134);
        assert_eq!(RouterError::InvalidOperation("x".into()).code(), 8060);
    }
}
