//! Collection config cache
//!
//! One entry per namespace, created lazily on first access and replaced
//! wholesale on reload. The map lock covers only slot lookup and insertion;
//! metadata fetches run under a per-namespace async mutex so a slow reload of
//! one namespace never blocks readers or reloads of another.

use crate::directory::PartitionDirectory;
use crate::error::{Result, RouterError};
use crate::key::{KeyValue, ShardKeyPattern};
use crate::metadata::MetadataStore;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Routing-relevant sharding state of one namespace
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    pub ns: String,
    pub partitioned: bool,
    pub shard_key: Option<ShardKeyPattern>,
    /// Present iff `partitioned`
    pub directory: Option<Arc<PartitionDirectory>>,
    /// Owner shard when the collection is not partitioned
    pub primary_shard: Option<String>,
}

impl CollectionConfig {
    /// An unpartitioned namespace living on `primary`
    pub fn unpartitioned(ns: impl Into<String>, primary: Option<String>) -> Self {
        Self {
            ns: ns.into(),
            partitioned: false,
            shard_key: None,
            directory: None,
            primary_shard: primary,
        }
    }

    /// The single shard that holds this namespace
    ///
    /// Only meaningful for unpartitioned namespaces or partitioned ones that
    /// still consist of one chunk.
    pub fn primary_shard(&self) -> Result<String> {
        if let Some(directory) = &self.directory {
            if directory.num_chunks() > 1 {
                return Err(RouterError::InvalidOperation(format!(
                    "can't call primaryShard on a sharded collection: {}",
                    self.ns
                )));
            }
            return Ok(directory.find_chunk(&KeyValue::MinKey)?.shard.clone());
        }
        self.primary_shard
            .clone()
            .ok_or_else(|| RouterError::NoPrimaryShard(self.ns.clone()))
    }

    pub fn version(&self) -> u64 {
        self.directory.as_ref().map(|d| d.version()).unwrap_or(0)
    }
}

#[derive(Default)]
struct CacheSlot {
    config: RwLock<Option<Arc<CollectionConfig>>>,
    reload_lock: tokio::sync::Mutex<()>,
}

/// Process-wide cache of collection configs, keyed by namespace
pub struct CollectionCache {
    store: Arc<dyn MetadataStore>,
    default_shard: Option<String>,
    slots: Mutex<HashMap<String, Arc<CacheSlot>>>,
    reloads: AtomicU64,
}

impl CollectionCache {
    /// Create a cache; `default_shard` serves namespaces unknown to the store
    pub fn new(store: Arc<dyn MetadataStore>, default_shard: Option<String>) -> Self {
        Self {
            store,
            default_shard,
            slots: Mutex::new(HashMap::new()),
            reloads: AtomicU64::new(0),
        }
    }

    fn slot(&self, ns: &str) -> Arc<CacheSlot> {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(ns.to_string()).or_default())
    }

    /// Cached config for `ns`, populating it from the metadata store on first access
    pub async fn get(&self, ns: &str) -> Result<Arc<CollectionConfig>> {
        let slot = self.slot(ns);
        let cached = slot.config.read().clone();
        if let Some(config) = cached {
            return Ok(config);
        }

        let _guard = slot.reload_lock.lock().await;
        // Another task may have populated the slot while we waited
        let cached = slot.config.read().clone();
        if let Some(config) = cached {
            return Ok(config);
        }

        let config = Arc::new(self.fetch(ns).await?);
        *slot.config.write() = Some(Arc::clone(&config));
        Ok(config)
    }

    /// Force a synchronous re-fetch of `ns` from the metadata store
    pub async fn reload(&self, ns: &str) -> Result<Arc<CollectionConfig>> {
        let slot = self.slot(ns);
        let _guard = slot.reload_lock.lock().await;

        let config = Arc::new(self.fetch(ns).await?);
        *slot.config.write() = Some(Arc::clone(&config));

        self.reloads.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("shardgate_config_reloads_total").increment(1);
        info!(ns = %ns, version = config.version(), "Reloaded collection config");
        Ok(config)
    }

    /// Drop the cached entry for `ns`; the next `get` fetches it again
    pub fn invalidate(&self, ns: &str) {
        self.slots.lock().remove(ns);
    }

    /// Number of forced reloads performed so far
    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    async fn fetch(&self, ns: &str) -> Result<CollectionConfig> {
        let state = self
            .store
            .load_sharding_state(ns)
            .await
            .map_err(|e| RouterError::ConfigUnavailable(e.to_string()))?;

        let Some(state) = state else {
            debug!(ns = %ns, "Namespace unknown to metadata store, using default shard");
            return Ok(CollectionConfig::unpartitioned(ns, self.default_shard.clone()));
        };

        if !state.partitioned {
            return Ok(CollectionConfig::unpartitioned(ns, Some(state.primary_shard)));
        }

        let shard_key = state
            .shard_key
            .clone()
            .ok_or_else(|| RouterError::NoShardInfo(ns.to_string()))?;
        let chunks = self
            .store
            .load_chunks(ns)
            .await
            .map_err(|e| RouterError::ConfigUnavailable(e.to_string()))?;
        let directory = PartitionDirectory::build(ns, shard_key.clone(), chunks, state.version)?;
        debug!(
            ns = %ns,
            chunks = directory.num_chunks(),
            version = directory.version(),
            "Built partition directory"
        );

        Ok(CollectionConfig {
            ns: ns.to_string(),
            partitioned: true,
            shard_key: Some(shard_key),
            directory: Some(Arc::new(directory)),
            primary_shard: Some(state.primary_shard),
        })
    }
}
