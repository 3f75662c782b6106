//! Migration collaborator
//!
//! Asks a shard to move a chunk. The receiving shard must treat a repeated
//! request for the same chunk and target as a no-op, which covers the short
//! window in which two balancers may both believe they hold the lease.

use crate::directory::Chunk;
use crate::metadata::MetadataResult;
use crate::registry::Shard;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Answer to a migration request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationOutcome {
    /// The shard accepted and completed the move
    Accepted,
    /// The shard declined (busy, chunk locked, ...)
    Rejected(String),
}

#[async_trait]
pub trait Migrator: Send + Sync {
    async fn request_migration(&self, chunk: &Chunk, target: &Shard)
        -> MetadataResult<MigrationOutcome>;
}
