//! Partition directory: the ordered chunk map of one partitioned collection
//!
//! Chunks are keyed by their inclusive minimum. A directory is only ever
//! built whole from a chunk list and validated on construction, so every key
//! between `MinKey` and `MaxKey` lands in exactly one chunk. Reloads build a
//! new directory and swap the `Arc`; readers holding the old one keep a
//! complete, consistent view.

use crate::error::{Result, RouterError};
use crate::key::{KeyValue, ShardKeyPattern};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A contiguous key range `[min, max)` owned by one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Owning collection namespace (`db.collection`)
    pub ns: String,
    /// Inclusive lower bound
    pub min: KeyValue,
    /// Exclusive upper bound
    pub max: KeyValue,
    /// Owning shard id
    pub shard: String,
    /// Approximate data size in bytes
    #[serde(default)]
    pub size_bytes: u64,
    /// Set while a migration of this chunk is in flight
    #[serde(default)]
    pub migrating: bool,
}

impl Chunk {
    pub fn new(
        ns: impl Into<String>,
        min: KeyValue,
        max: KeyValue,
        shard: impl Into<String>,
    ) -> Self {
        Self {
            ns: ns.into(),
            min,
            max,
            shard: shard.into(),
            size_bytes: 0,
            migrating: false,
        }
    }

    /// Stable identifier: namespace plus minimum key
    pub fn id(&self) -> String {
        format!("{}-{}", self.ns, self.min)
    }

    pub fn contains(&self, key: &KeyValue) -> bool {
        self.min <= *key && (*key < self.max || self.max.is_max())
    }
}

/// Ordered set of chunks for one collection
#[derive(Debug, Clone)]
pub struct PartitionDirectory {
    ns: String,
    shard_key: ShardKeyPattern,
    chunks: BTreeMap<KeyValue, Chunk>,
    version: u64,
}

impl PartitionDirectory {
    /// Build a directory, checking the chunks cover the key space exactly once
    pub fn build(
        ns: impl Into<String>,
        shard_key: ShardKeyPattern,
        chunks: Vec<Chunk>,
        version: u64,
    ) -> Result<Self> {
        let ns = ns.into();
        let mut sorted = chunks;
        sorted.sort_by(|a, b| a.min.cmp(&b.min));

        let first = sorted.first().ok_or_else(|| RouterError::NoShardInfo(ns.clone()))?;
        if !first.min.is_min() {
            return Err(RouterError::InconsistentDirectory(format!(
                "{}: first chunk starts at {} instead of MinKey",
                ns, first.min
            )));
        }

        let mut expected_min = KeyValue::MinKey;
        for chunk in &sorted {
            if chunk.ns != ns {
                return Err(RouterError::InconsistentDirectory(format!(
                    "chunk {} belongs to {}, not {}",
                    chunk.id(),
                    chunk.ns,
                    ns
                )));
            }
            if chunk.min != expected_min {
                return Err(RouterError::InconsistentDirectory(format!(
                    "{}: gap or overlap at {} (expected {})",
                    ns, chunk.min, expected_min
                )));
            }
            if chunk.min >= chunk.max {
                return Err(RouterError::InconsistentDirectory(format!(
                    "{}: empty chunk range [{}, {})",
                    ns, chunk.min, chunk.max
                )));
            }
            expected_min = chunk.max.clone();
        }
        if !expected_min.is_max() {
            return Err(RouterError::InconsistentDirectory(format!(
                "{}: last chunk ends at {} instead of MaxKey",
                ns, expected_min
            )));
        }

        Ok(Self {
            ns,
            shard_key,
            chunks: sorted.into_iter().map(|c| (c.min.clone(), c)).collect(),
            version,
        })
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn shard_key(&self) -> &ShardKeyPattern {
        &self.shard_key
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    /// The chunk owning `key`
    pub fn find_chunk(&self, key: &KeyValue) -> Result<&Chunk> {
        self.chunks
            .range(..=key.clone())
            .next_back()
            .map(|(_, chunk)| chunk)
            .ok_or_else(|| {
                RouterError::InconsistentDirectory(format!("{}: no chunk for key {}", self.ns, key))
            })
    }

    /// Chunks overlapping the inclusive key range `[min, max]`
    pub fn chunks_for_range(&self, min: &KeyValue, max: &KeyValue) -> Vec<&Chunk> {
        if min > max {
            return Vec::new();
        }
        let start = self
            .chunks
            .range(..=min.clone())
            .next_back()
            .map(|(k, _)| k.clone())
            .unwrap_or(KeyValue::MinKey);

        self.chunks
            .range(start..)
            .take_while(|(k, _)| *k <= max)
            .map(|(_, chunk)| chunk)
            .collect()
    }

    /// Distinct shards owning at least one chunk
    pub fn shards(&self) -> BTreeSet<String> {
        self.chunks.values().map(|c| c.shard.clone()).collect()
    }

    pub fn chunks_on(&self, shard: &str) -> Vec<&Chunk> {
        self.chunks.values().filter(|c| c.shard == shard).collect()
    }
}

/// Split the chunk containing `at` into `[min, at)` and `[at, max)`
///
/// Both halves stay on the original shard and share its size estimate.
pub fn split_chunks(chunks: &[Chunk], at: &KeyValue) -> Result<Vec<Chunk>> {
    if at.is_min() || at.is_max() {
        return Err(RouterError::InvalidOperation(format!(
            "cannot split at global bound {}",
            at
        )));
    }

    let pos = chunks
        .iter()
        .position(|c| c.contains(at))
        .ok_or_else(|| RouterError::InvalidOperation(format!("no chunk contains {}", at)))?;

    let target = &chunks[pos];
    if target.min == *at {
        return Err(RouterError::InvalidOperation(format!(
            "split point {} is already a chunk boundary",
            at
        )));
    }

    let mut left = target.clone();
    let mut right = target.clone();
    left.max = at.clone();
    right.min = at.clone();
    left.size_bytes = target.size_bytes / 2;
    right.size_bytes = target.size_bytes - left.size_bytes;

    let mut out = Vec::with_capacity(chunks.len() + 1);
    out.extend_from_slice(&chunks[..pos]);
    out.push(left);
    out.push(right);
    out.extend_from_slice(&chunks[pos + 1..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_chunks() -> Vec<Chunk> {
        vec![
            Chunk::new("db.users", KeyValue::MinKey, KeyValue::Int(100), "s1"),
            Chunk::new("db.users", KeyValue::Int(100), KeyValue::Int(200), "s2"),
            Chunk::new("db.users", KeyValue::Int(200), KeyValue::MaxKey, "s1"),
        ]
    }

    fn directory() -> PartitionDirectory {
        PartitionDirectory::build("db.users", ShardKeyPattern::new("uid"), three_chunks(), 3)
            .unwrap()
    }

    #[test]
    fn test_find_chunk() {
        let dir = directory();
        assert_eq!(dir.find_chunk(&KeyValue::Int(-5)).unwrap().shard, "s1");
        assert_eq!(dir.find_chunk(&KeyValue::Int(100)).unwrap().shard, "s2");
        assert_eq!(dir.find_chunk(&KeyValue::Int(199)).unwrap().shard, "s2");
        assert_eq!(dir.find_chunk(&KeyValue::Int(200)).unwrap().shard, "s1");
        assert_eq!(dir.find_chunk(&KeyValue::Str("x".into())).unwrap().min, KeyValue::Int(200));
    }

    #[test]
    fn test_build_rejects_gap() {
        let mut chunks = three_chunks();
        chunks[1].min = KeyValue::Int(101);
        let err = PartitionDirectory::build("db.users", ShardKeyPattern::new("uid"), chunks, 1)
            .unwrap_err();
        assert!(matches!(err, RouterError::InconsistentDirectory(_)));
    }

    #[test]
    fn test_build_rejects_open_end() {
        let mut chunks = three_chunks();
        chunks.pop();
        let err = PartitionDirectory::build("db.users", ShardKeyPattern::new("uid"), chunks, 1)
            .unwrap_err();
        assert!(matches!(err, RouterError::InconsistentDirectory(_)));
    }

    #[test]
    fn test_build_rejects_empty() {
        let err = PartitionDirectory::build("db.users", ShardKeyPattern::new("uid"), vec![], 1)
            .unwrap_err();
        assert_eq!(err, RouterError::NoShardInfo("db.users".into()));
    }

    #[test]
    fn test_chunks_for_range() {
        let dir = directory();
        let hits = dir.chunks_for_range(&KeyValue::Int(150), &KeyValue::Int(250));
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].min, KeyValue::Int(100));
        assert_eq!(hits[1].min, KeyValue::Int(200));

        let inside = dir.chunks_for_range(&KeyValue::Int(10), &KeyValue::Int(20));
        assert_eq!(inside.len(), 1);
        assert_eq!(inside[0].shard, "s1");

        let all = dir.chunks_for_range(&KeyValue::MinKey, &KeyValue::MaxKey);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_shards_and_chunks_on() {
        let dir = directory();
        assert_eq!(dir.shards().into_iter().collect::<Vec<_>>(), vec!["s1", "s2"]);
        assert_eq!(dir.chunks_on("s1").len(), 2);
        assert_eq!(dir.chunks_on("s3").len(), 0);
    }

    #[test]
    fn test_split_chunks() {
        let mut chunks = vec![Chunk::new("db.t", KeyValue::MinKey, KeyValue::MaxKey, "s1")];
        chunks[0].size_bytes = 11;

        let split = split_chunks(&chunks, &KeyValue::Int(50)).unwrap();
        assert_eq!(split.len(), 2);
        assert_eq!(split[0].max, KeyValue::Int(50));
        assert_eq!(split[1].min, KeyValue::Int(50));
        assert_eq!(split[0].size_bytes + split[1].size_bytes, 11);

        assert!(split_chunks(&split, &KeyValue::Int(50)).is_err());
        assert!(split_chunks(&split, &KeyValue::MinKey).is_err());
    }
}
