//! Balancer error types

use serde::{Deserialize, Serialize};
use shardgate::MetadataError;
use thiserror::Error;

/// Errors that abort one balancing step; never surfaced to clients
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalancerError {
    #[error("metadata store error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("chunk identifiers inconsistent: {0}")]
    InconsistentOids(String),

    #[error("invalid partition directory for {ns}: {reason}")]
    Directory { ns: String, reason: String },

    #[error("shard not found: {0}")]
    ShardNotFound(String),
}

impl BalancerError {
    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            BalancerError::Metadata(_) => "metadata",
            BalancerError::InconsistentOids(_) => "inconsistent_oids",
            BalancerError::Directory { .. } => "directory",
            BalancerError::ShardNotFound(_) => "shard_not_found",
        }
    }
}

pub type Result<T> = std::result::Result<T, BalancerError>;
