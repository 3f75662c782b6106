//! Shard registry: shard identifier -> connection endpoint
//!
//! A `ShardRegistry` is an immutable snapshot. `RegistryCache` holds the
//! current snapshot and swaps in a fresh one when a lookup misses.

use crate::error::{Result, RouterError};
use crate::metadata::MetadataStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// A backend partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// Shard identifier
    pub id: String,
    /// Connection endpoint (host:port)
    pub endpoint: String,
}

impl Shard {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// Immutable snapshot of all known shards
#[derive(Debug, Clone, Default)]
pub struct ShardRegistry {
    shards: BTreeMap<String, Shard>,
}

impl ShardRegistry {
    pub fn from_shards(shards: impl IntoIterator<Item = Shard>) -> Self {
        Self {
            shards: shards.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Shard> {
        self.shards.get(id)
    }

    /// Shard ids in sorted order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.shards.keys().map(String::as_str)
    }

    pub fn shards(&self) -> impl Iterator<Item = &Shard> {
        self.shards.values()
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

/// Current registry snapshot, refreshed from the metadata store on demand
#[derive(Debug, Default)]
pub struct RegistryCache {
    current: RwLock<Arc<ShardRegistry>>,
}

impl RegistryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<ShardRegistry> {
        Arc::clone(&self.current.read())
    }

    /// Replace the snapshot with the metadata store's current shard list
    pub async fn refresh(&self, store: &dyn MetadataStore) -> Result<Arc<ShardRegistry>> {
        let shards = store
            .load_shards()
            .await
            .map_err(|e| RouterError::ConfigUnavailable(e.to_string()))?;
        let registry = Arc::new(ShardRegistry::from_shards(shards));
        debug!("Shard registry refreshed with {} shards", registry.len());
        *self.current.write() = Arc::clone(&registry);
        Ok(registry)
    }

    /// Look up a shard, refreshing once if it is unknown to the current snapshot
    pub async fn resolve(&self, store: &dyn MetadataStore, id: &str) -> Result<Shard> {
        if let Some(shard) = self.snapshot().get(id) {
            return Ok(shard.clone());
        }
        self.refresh(store)
            .await?
            .get(id)
            .cloned()
            .ok_or_else(|| RouterError::ShardNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryMetadataStore;

    #[test]
    fn test_registry_lookup() {
        let registry = ShardRegistry::from_shards(vec![
            Shard::new("shard-b", "10.0.0.2:27018"),
            Shard::new("shard-a", "10.0.0.1:27018"),
        ]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("shard-a").unwrap().endpoint, "10.0.0.1:27018");
        assert!(registry.get("shard-c").is_none());
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["shard-a", "shard-b"]);
    }

    #[tokio::test]
    async fn test_resolve_refreshes_on_miss() {
        let store = MemoryMetadataStore::new();
        let cache = RegistryCache::new();
        assert!(cache.snapshot().is_empty());

        store.add_shard("s1", "127.0.0.1:27018");
        let shard = cache.resolve(&store, "s1").await.unwrap();
        assert_eq!(shard.endpoint, "127.0.0.1:27018");
        assert_eq!(cache.snapshot().len(), 1);

        let err = cache.resolve(&store, "nope").await.unwrap_err();
        assert_eq!(err, RouterError::ShardNotFound("nope".into()));
    }
}
