//! Populate the embedded metadata store from `[[shards]]` and `[[collections]]`

use shardgate::{Config, KeyValue, MemoryMetadataStore, Result, ShardKeyPattern};
use tracing::info;

pub fn seed_store(store: &MemoryMetadataStore, config: &Config) -> Result<()> {
    for shard in &config.shards {
        store.add_shard(&shard.id, &shard.endpoint);
    }

    for coll in &config.collections {
        match &coll.shard_key {
            None => store.create_unpartitioned(&coll.ns, &coll.primary)?,
            Some(field) => {
                store.shard_collection(&coll.ns, ShardKeyPattern::new(field.as_str()), &coll.primary)?;
                for point in &coll.split_points {
                    store.split(&coll.ns, &KeyValue::from(point.clone()))?;
                }
            }
        }
        info!(
            ns = %coll.ns,
            primary = %coll.primary,
            partitioned = coll.shard_key.is_some(),
            chunks = coll.split_points.len() + 1,
            "Seeded collection"
        );
    }

    info!(
        shards = config.shards.len(),
        collections = config.collections.len(),
        "Metadata store seeded"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardgate::config::{CollectionSeed, ShardSeed, SplitPoint};

    #[test]
    fn test_seed_partitioned_and_plain_collections() {
        let config = Config {
            shards: vec![
                ShardSeed {
                    id: "s1".into(),
                    endpoint: "127.0.0.1:28001".into(),
                },
                ShardSeed {
                    id: "s2".into(),
                    endpoint: "127.0.0.1:28002".into(),
                },
            ],
            collections: vec![
                CollectionSeed {
                    ns: "db.users".into(),
                    primary: "s1".into(),
                    shard_key: Some("uid".into()),
                    split_points: vec![SplitPoint::Int(100), SplitPoint::Int(200)],
                },
                CollectionSeed {
                    ns: "db.logs".into(),
                    primary: "s2".into(),
                    shard_key: None,
                    split_points: Vec::new(),
                },
            ],
            ..Default::default()
        };

        let store = MemoryMetadataStore::new();
        seed_store(&store, &config).unwrap();

        let chunks = store.chunks("db.users");
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.shard == "s1"));
        assert_eq!(chunks[1].min, KeyValue::Int(100));
        assert!(store.chunks("db.logs").is_empty());
    }
}
