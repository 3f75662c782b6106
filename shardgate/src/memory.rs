//! Embedded in-process metadata store
//!
//! Keeps shards, namespaces, chunks, the balancer liveness record and a
//! migration log behind one lock. Serves the server's embedded mode and the
//! tests; also answers migration requests by re-owning chunks directly.
//!
//! Failure injection: `set_available(false)` makes every collaborator call
//! fail with `Unreachable`, `set_oids_consistent(false)` fails the identifier
//! check regardless of the chunks, `set_accept_migrations(false)` makes
//! migrations come back rejected. `set_chunks` stores a chunk list as given.

use crate::directory::{split_chunks, Chunk, PartitionDirectory};
use crate::error::{Result, RouterError};
use crate::key::{KeyValue, ShardKeyPattern};
use crate::metadata::{
    LeaseOutcome, LivenessRecord, MetadataError, MetadataResult, MetadataStore, OidCheck,
    ShardingState,
};
use crate::migration::{MigrationOutcome, Migrator};
use crate::registry::Shard;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// One entry of the migration log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub chunk_id: String,
    pub from: String,
    pub to: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Namespace {
    state: ShardingState,
    chunks: Vec<Chunk>,
}

#[derive(Debug, Default)]
struct Inner {
    shards: BTreeMap<String, Shard>,
    namespaces: BTreeMap<String, Namespace>,
    liveness: Option<LivenessRecord>,
    migrations: Vec<MigrationRecord>,
}

impl Inner {
    fn namespace_mut(&mut self, ns: &str) -> Result<&mut Namespace> {
        self.namespaces
            .get_mut(ns)
            .ok_or_else(|| RouterError::InvalidOperation(format!("unknown namespace {}", ns)))
    }

    /// First identifier problem across all partitioned namespaces
    fn chunk_inconsistency(&self) -> Option<String> {
        for (ns, namespace) in self.namespaces.iter().filter(|(_, n)| n.state.partitioned) {
            let mut seen = HashSet::new();
            for chunk in &namespace.chunks {
                if chunk.ns != *ns {
                    return Some(format!("chunk {} filed under {}", chunk.id(), ns));
                }
                if !seen.insert(chunk.id()) {
                    return Some(format!("duplicate chunk id {}", chunk.id()));
                }
                if !self.shards.contains_key(&chunk.shard) {
                    return Some(format!("chunk {} on unknown shard {}", chunk.id(), chunk.shard));
                }
            }

            let Some(key) = namespace.state.shard_key.clone() else {
                return Some(format!("{} is partitioned without a shard key", ns));
            };
            if let Err(e) = PartitionDirectory::build(
                ns.as_str(),
                key,
                namespace.chunks.clone(),
                namespace.state.version,
            ) {
                return Some(e.to_string());
            }
        }
        None
    }

    fn require_shard(&self, id: &str) -> Result<()> {
        if self.shards.contains_key(id) {
            Ok(())
        } else {
            Err(RouterError::ShardNotFound(id.to_string()))
        }
    }
}

#[derive(Debug)]
pub struct MemoryMetadataStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
    oids_consistent: AtomicBool,
    accept_migrations: AtomicBool,
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
            oids_consistent: AtomicBool::new(true),
            accept_migrations: AtomicBool::new(true),
        }
    }

    /// Register a shard, replacing any endpoint it had
    pub fn add_shard(&self, id: &str, endpoint: &str) {
        self.inner
            .lock()
            .shards
            .insert(id.to_string(), Shard::new(id, endpoint));
    }

    /// Create an unpartitioned namespace living on `primary`
    pub fn create_unpartitioned(&self, ns: &str, primary: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.require_shard(primary)?;
        inner.namespaces.insert(
            ns.to_string(),
            Namespace {
                state: ShardingState {
                    partitioned: false,
                    shard_key: None,
                    primary_shard: primary.to_string(),
                    version: 0,
                },
                chunks: Vec::new(),
            },
        );
        Ok(())
    }

    /// Partition `ns` on `key`, starting with one chunk on `primary`
    pub fn shard_collection(&self, ns: &str, key: ShardKeyPattern, primary: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.require_shard(primary)?;
        if inner
            .namespaces
            .get(ns)
            .map(|n| n.state.partitioned)
            .unwrap_or(false)
        {
            return Err(RouterError::InvalidOperation(format!("{} is already sharded", ns)));
        }

        let chunk = Chunk::new(ns, key.global_min(), key.global_max(), primary);
        inner.namespaces.insert(
            ns.to_string(),
            Namespace {
                state: ShardingState {
                    partitioned: true,
                    shard_key: Some(key),
                    primary_shard: primary.to_string(),
                    version: 1,
                },
                chunks: vec![chunk],
            },
        );
        debug!(ns = %ns, primary = %primary, "Sharded collection");
        Ok(())
    }

    /// Split the chunk containing `at`
    pub fn split(&self, ns: &str, at: &KeyValue) -> Result<()> {
        let mut inner = self.inner.lock();
        let namespace = inner.namespace_mut(ns)?;
        namespace.chunks = split_chunks(&namespace.chunks, at)?;
        namespace.state.version += 1;
        Ok(())
    }

    /// Re-own the chunk starting at `min`
    pub fn move_chunk(&self, ns: &str, min: &KeyValue, to: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.require_shard(to)?;
        let namespace = inner.namespace_mut(ns)?;
        let chunk = namespace
            .chunks
            .iter_mut()
            .find(|c| c.min == *min)
            .ok_or_else(|| RouterError::InvalidOperation(format!("no chunk at {} in {}", min, ns)))?;
        chunk.shard = to.to_string();
        chunk.migrating = false;
        namespace.state.version += 1;
        Ok(())
    }

    pub fn set_chunk_size(&self, ns: &str, min: &KeyValue, size_bytes: u64) -> Result<()> {
        self.with_chunk(ns, min, |c| c.size_bytes = size_bytes)
    }

    pub fn set_migrating(&self, ns: &str, min: &KeyValue, migrating: bool) -> Result<()> {
        self.with_chunk(ns, min, |c| c.migrating = migrating)
    }

    fn with_chunk(&self, ns: &str, min: &KeyValue, f: impl FnOnce(&mut Chunk)) -> Result<()> {
        let mut inner = self.inner.lock();
        let chunk = inner
            .namespace_mut(ns)?
            .chunks
            .iter_mut()
            .find(|c| c.min == *min)
            .ok_or_else(|| RouterError::InvalidOperation(format!("no chunk at {} in {}", min, ns)))?;
        f(chunk);
        Ok(())
    }

    /// Replace the chunk list of `ns` as given, without validation
    pub fn set_chunks(&self, ns: &str, chunks: Vec<Chunk>) -> Result<()> {
        let mut inner = self.inner.lock();
        let namespace = inner.namespace_mut(ns)?;
        namespace.chunks = chunks;
        namespace.state.version += 1;
        Ok(())
    }

    pub fn chunks(&self, ns: &str) -> Vec<Chunk> {
        self.inner
            .lock()
            .namespaces
            .get(ns)
            .map(|n| n.chunks.clone())
            .unwrap_or_default()
    }

    pub fn migrations(&self) -> Vec<MigrationRecord> {
        self.inner.lock().migrations.clone()
    }

    pub fn liveness_record(&self) -> Option<LivenessRecord> {
        self.inner.lock().liveness.clone()
    }

    /// Overwrite the liveness record unconditionally
    pub fn set_liveness_record(&self, record: Option<LivenessRecord>) {
        self.inner.lock().liveness = record;
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_oids_consistent(&self, consistent: bool) {
        self.oids_consistent.store(consistent, Ordering::SeqCst);
    }

    pub fn set_accept_migrations(&self, accept: bool) {
        self.accept_migrations.store(accept, Ordering::SeqCst);
    }

    fn check_available(&self) -> MetadataResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MetadataError::Unreachable("embedded store offline".into()))
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn load_shards(&self) -> MetadataResult<Vec<Shard>> {
        self.check_available()?;
        Ok(self.inner.lock().shards.values().cloned().collect())
    }

    async fn load_sharding_state(&self, ns: &str) -> MetadataResult<Option<ShardingState>> {
        self.check_available()?;
        Ok(self.inner.lock().namespaces.get(ns).map(|n| n.state.clone()))
    }

    async fn load_chunks(&self, ns: &str) -> MetadataResult<Vec<Chunk>> {
        self.check_available()?;
        self.inner
            .lock()
            .namespaces
            .get(ns)
            .map(|n| n.chunks.clone())
            .ok_or_else(|| MetadataError::NotFound(ns.to_string()))
    }

    async fn list_partitioned(&self) -> MetadataResult<Vec<String>> {
        self.check_available()?;
        Ok(self
            .inner
            .lock()
            .namespaces
            .iter()
            .filter(|(_, n)| n.state.partitioned)
            .map(|(ns, _)| ns.clone())
            .collect())
    }

    async fn write_liveness_record(
        &self,
        record: &LivenessRecord,
        lease: Duration,
    ) -> MetadataResult<LeaseOutcome> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        if let Some(current) = &inner.liveness {
            if current.who != record.who && !current.is_expired(record.ping, lease) {
                return Ok(LeaseOutcome::HeldBy(current.clone()));
            }
        }
        inner.liveness = Some(record.clone());
        Ok(LeaseOutcome::Acquired)
    }

    async fn read_liveness_record(&self) -> MetadataResult<Option<LivenessRecord>> {
        self.check_available()?;
        Ok(self.inner.lock().liveness.clone())
    }

    async fn check_oids(&self) -> MetadataResult<OidCheck> {
        self.check_available()?;
        if !self.oids_consistent.load(Ordering::SeqCst) {
            return Ok(OidCheck::Inconsistent(
                "chunk identifiers do not match across config servers".into(),
            ));
        }
        match self.inner.lock().chunk_inconsistency() {
            Some(reason) => Ok(OidCheck::Inconsistent(reason)),
            None => Ok(OidCheck::Consistent),
        }
    }

    async fn record_migration(&self, chunk_id: &str, from: &str, to: &str) -> MetadataResult<()> {
        self.check_available()?;
        self.inner.lock().migrations.push(MigrationRecord {
            chunk_id: chunk_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }
}

#[async_trait]
impl Migrator for MemoryMetadataStore {
    async fn request_migration(
        &self,
        chunk: &Chunk,
        target: &Shard,
    ) -> MetadataResult<MigrationOutcome> {
        self.check_available()?;
        if !self.accept_migrations.load(Ordering::SeqCst) {
            return Ok(MigrationOutcome::Rejected("shard busy".into()));
        }

        let mut inner = self.inner.lock();
        if !inner.shards.contains_key(&target.id) {
            return Ok(MigrationOutcome::Rejected(format!("unknown shard {}", target.id)));
        }
        let Some(namespace) = inner.namespaces.get_mut(&chunk.ns) else {
            return Err(MetadataError::NotFound(chunk.ns.clone()));
        };
        let Some(current) = namespace.chunks.iter_mut().find(|c| c.min == chunk.min) else {
            return Ok(MigrationOutcome::Rejected(format!("chunk {} no longer exists", chunk.id())));
        };

        // Repeating a completed move is a no-op
        if current.shard == target.id {
            return Ok(MigrationOutcome::Accepted);
        }
        if current.shard != chunk.shard {
            return Ok(MigrationOutcome::Rejected(format!(
                "chunk {} is owned by {}, not {}",
                chunk.id(),
                current.shard,
                chunk.shard
            )));
        }

        current.shard = target.id.clone();
        current.migrating = false;
        namespace.state.version += 1;
        Ok(MigrationOutcome::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryMetadataStore {
        let store = MemoryMetadataStore::new();
        store.add_shard("s1", "127.0.0.1:27018");
        store.add_shard("s2", "127.0.0.1:27019");
        store
    }

    fn record(who: &str, ping: DateTime<Utc>) -> LivenessRecord {
        LivenessRecord {
            who: who.into(),
            ping,
            up_secs: 0,
        }
    }

    #[tokio::test]
    async fn test_lease_is_conditional() {
        let store = store();
        let lease = Duration::from_secs(30);
        let now = Utc::now();

        let a = record("a", now);
        assert_eq!(store.write_liveness_record(&a, lease).await.unwrap(), LeaseOutcome::Acquired);

        let b = record("b", now);
        assert_eq!(
            store.write_liveness_record(&b, lease).await.unwrap(),
            LeaseOutcome::HeldBy(a.clone())
        );

        // Refresh by the holder always succeeds
        let a2 = record("a", now + chrono::Duration::seconds(5));
        assert_eq!(store.write_liveness_record(&a2, lease).await.unwrap(), LeaseOutcome::Acquired);

        // Once expired, anyone can take it
        let b2 = record("b", now + chrono::Duration::seconds(60));
        assert_eq!(store.write_liveness_record(&b2, lease).await.unwrap(), LeaseOutcome::Acquired);
        assert_eq!(store.read_liveness_record().await.unwrap().unwrap().who, "b");
    }

    #[tokio::test]
    async fn test_migration_is_idempotent() {
        let store = store();
        store.shard_collection("db.t", ShardKeyPattern::new("k"), "s1").unwrap();
        let chunk = store.chunks("db.t")[0].clone();
        let target = Shard::new("s2", "127.0.0.1:27019");

        assert_eq!(
            store.request_migration(&chunk, &target).await.unwrap(),
            MigrationOutcome::Accepted
        );
        assert_eq!(
            store.request_migration(&chunk, &target).await.unwrap(),
            MigrationOutcome::Accepted
        );
        assert_eq!(store.chunks("db.t")[0].shard, "s2");
        assert_eq!(store.load_sharding_state("db.t").await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_migration_rejections() {
        let store = store();
        store.shard_collection("db.t", ShardKeyPattern::new("k"), "s1").unwrap();
        let chunk = store.chunks("db.t")[0].clone();

        let unknown = Shard::new("s9", "nowhere:1");
        assert!(matches!(
            store.request_migration(&chunk, &unknown).await.unwrap(),
            MigrationOutcome::Rejected(_)
        ));

        store.set_accept_migrations(false);
        let target = Shard::new("s2", "127.0.0.1:27019");
        assert!(matches!(
            store.request_migration(&chunk, &target).await.unwrap(),
            MigrationOutcome::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = store();
        store.set_available(false);
        assert!(matches!(store.load_shards().await, Err(MetadataError::Unreachable(_))));
        assert!(store.check_oids().await.is_err());
        assert!(store.list_partitioned().await.is_err());
    }

    #[test]
    fn test_admin_operations() {
        let store = store();
        assert!(matches!(
            store.shard_collection("db.t", ShardKeyPattern::new("k"), "s9"),
            Err(RouterError::ShardNotFound(_))
        ));
        store.shard_collection("db.t", ShardKeyPattern::new("k"), "s1").unwrap();
        store.split("db.t", &KeyValue::Int(10)).unwrap();
        store.move_chunk("db.t", &KeyValue::Int(10), "s2").unwrap();
        store.set_chunk_size("db.t", &KeyValue::Int(10), 4096).unwrap();

        let chunks = store.chunks("db.t");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].shard, "s2");
        assert_eq!(chunks[1].size_bytes, 4096);
        assert!(store.move_chunk("db.t", &KeyValue::Int(11), "s2").is_err());
    }

    #[tokio::test]
    async fn test_check_oids_walks_chunks() {
        let store = store();
        store.shard_collection("db.users", ShardKeyPattern::new("uid"), "s1").unwrap();
        store.split("db.users", &KeyValue::Int(100)).unwrap();
        assert_eq!(store.check_oids().await.unwrap(), OidCheck::Consistent);

        // Two chunks starting at MinKey share an id and leave a gap
        let mut chunks = store.chunks("db.users");
        chunks[1].min = KeyValue::MinKey;
        store.set_chunks("db.users", chunks).unwrap();

        match store.check_oids().await.unwrap() {
            OidCheck::Inconsistent(reason) => assert!(reason.contains("duplicate chunk id")),
            OidCheck::Consistent => panic!("duplicate ids must be reported"),
        }
    }

    #[tokio::test]
    async fn test_check_oids_reports_broken_coverage() {
        let store = store();
        store.shard_collection("db.users", ShardKeyPattern::new("uid"), "s1").unwrap();
        store.split("db.users", &KeyValue::Int(100)).unwrap();

        let mut chunks = store.chunks("db.users");
        chunks.pop();
        store.set_chunks("db.users", chunks).unwrap();

        assert!(matches!(
            store.check_oids().await.unwrap(),
            OidCheck::Inconsistent(_)
        ));
    }
}
