//! Forwarding collaborator
//!
//! Delivers one operation to one shard endpoint. Connection pooling and wire
//! framing live behind this trait.

use crate::error::Result;
use crate::registry::Shard;
use crate::request::Operation;
use async_trait::async_trait;
use serde_json::Value;

/// What a shard answered
#[derive(Debug, Clone, PartialEq)]
pub enum ShardResponse {
    /// The shard executed the operation
    Ok(Value),
    /// The shard does not (or no longer) own the targeted range
    StaleConfig(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Forward `op` to `shard`. Connectivity failures are `RouterError::Transport`.
    async fn forward(&self, shard: &Shard, op: &Operation) -> Result<ShardResponse>;
}
