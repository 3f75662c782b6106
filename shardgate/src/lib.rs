//! Shardgate - routing tier for a horizontally partitioned data store
//!
//! A router accepts client operations, works out which shards own the
//! affected keys, forwards the operation and recovers when its cached view of
//! the partition map turns out to be stale.
//!
//! # Architecture
//!
//! - **Registry**: shard id to endpoint, refreshed on a lookup miss
//! - **Directory**: ordered chunk map of one partitioned collection
//! - **Catalog**: per-namespace collection config cache with forced reload
//! - **Client**: per-connection shard affinity (double-buffered touch sets)
//! - **Request**: router, strategies and the bounded stale-config retry loop
//! - **Stats**: global, sharded and unsharded op counters
//!
//! The metadata store, the shard transport and the migration endpoint are
//! collaborator traits. `MemoryMetadataStore` implements the metadata store
//! and the migrator in-process.

pub mod catalog;
pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod key;
pub mod memory;
pub mod metadata;
pub mod migration;
pub mod registry;
pub mod request;
pub mod stats;
pub mod transport;

pub use catalog::{CollectionCache, CollectionConfig};
pub use client::{ClientContext, ClientId, ClientRegistry};
pub use config::{BalancerConfig, Config, LoadMetric, RouterConfig};
pub use directory::{split_chunks, Chunk, PartitionDirectory};
pub use error::{ErrorDocument, Result, RouterError};
pub use key::{KeyValue, ShardKeyPattern};
pub use memory::{MemoryMetadataStore, MigrationRecord};
pub use metadata::{
    LeaseOutcome, LivenessRecord, MetadataError, MetadataResult, MetadataStore, OidCheck,
    ShardingState,
};
pub use migration::{MigrationOutcome, Migrator};
pub use registry::{RegistryCache, Shard, ShardRegistry};
pub use request::{CursorHandle, OpKind, Operation, Reply, Request, Router, ShardResult};
pub use stats::{OpCountersSnapshot, RouterStats, RouterStatsSnapshot, Scope};
pub use transport::{ShardResponse, Transport};
