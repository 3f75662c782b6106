//! Metadata store collaborator
//!
//! The metadata store is the shared, transactional source of truth for shard
//! membership, collection sharding state, chunk ownership and the balancer's
//! liveness record. Every call may fail with a connectivity error; callers
//! treat a failure as "attempt aborted", never as success.

use crate::directory::Chunk;
use crate::key::ShardKeyPattern;
use crate::registry::Shard;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors returned by a metadata store client
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataError {
    #[error("metadata store unreachable: {0}")]
    Unreachable(String),

    #[error("metadata store returned corrupt data: {0}")]
    Corrupt(String),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

/// Sharding state of one namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingState {
    /// Whether the collection is partitioned across shards
    pub partitioned: bool,
    /// Shard key, present when partitioned
    pub shard_key: Option<ShardKeyPattern>,
    /// Shard holding the collection when it is not partitioned
    pub primary_shard: String,
    /// Monotonic version of the collection's chunk layout
    #[serde(default)]
    pub version: u64,
}

/// The balancer heartbeat record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessRecord {
    /// Identity of the balancer that wrote the record
    pub who: String,
    /// When the record was written
    pub ping: DateTime<Utc>,
    /// Seconds the writer has been up
    pub up_secs: i64,
}

impl LivenessRecord {
    /// Whether the record is older than `lease` as seen at `now`
    pub fn is_expired(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        let age = now.signed_duration_since(self.ping);
        age.to_std().map(|age| age > lease).unwrap_or(false)
    }
}

/// Result of a conditional liveness write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// The caller now holds the lease
    Acquired,
    /// Another live instance holds the lease
    HeldBy(LivenessRecord),
}

/// Result of the chunk identifier consistency check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OidCheck {
    Consistent,
    Inconsistent(String),
}

/// Client of the metadata store
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// All registered shards
    async fn load_shards(&self) -> MetadataResult<Vec<Shard>>;

    /// Sharding state of a namespace, `None` if the namespace is unknown
    async fn load_sharding_state(&self, ns: &str) -> MetadataResult<Option<ShardingState>>;

    /// Ordered chunk list of a partitioned namespace
    async fn load_chunks(&self, ns: &str) -> MetadataResult<Vec<Chunk>>;

    /// Namespaces that are partitioned
    async fn list_partitioned(&self) -> MetadataResult<Vec<String>>;

    /// Write the liveness record if it is absent, already ours, or older than
    /// `lease`. The check and the write are one atomic step.
    async fn write_liveness_record(
        &self,
        record: &LivenessRecord,
        lease: Duration,
    ) -> MetadataResult<LeaseOutcome>;

    async fn read_liveness_record(&self) -> MetadataResult<Option<LivenessRecord>>;

    /// Verify chunk identifiers are well formed across the metadata store
    async fn check_oids(&self) -> MetadataResult<OidCheck>;

    /// Record that `chunk_id` moved from `from` to `to`
    async fn record_migration(&self, chunk_id: &str, from: &str, to: &str) -> MetadataResult<()>;
}
