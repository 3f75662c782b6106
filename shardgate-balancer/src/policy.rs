//! Chunk selection policy
//!
//! Pure functions over a partition directory: per-shard load, the
//! most/least loaded pair with hysteresis, and which chunk to move.

use serde::{Deserialize, Serialize};
use shardgate::{Chunk, LoadMetric, PartitionDirectory};
use std::cmp::Ordering;

/// Load of one shard within one collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLoad {
    pub shard: String,
    pub chunks: u64,
    pub bytes: u64,
}

/// A decision to move one chunk's worth of load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Imbalance {
    pub from: String,
    pub to: String,
    /// Difference in the primary metric
    pub gap: u64,
}

/// Load of every known shard, including shards that own no chunk
pub fn shard_loads<'a>(
    shard_ids: impl IntoIterator<Item = &'a str>,
    directory: &PartitionDirectory,
) -> Vec<ShardLoad> {
    let mut loads: Vec<ShardLoad> = shard_ids
        .into_iter()
        .map(|id| ShardLoad {
            shard: id.to_string(),
            chunks: 0,
            bytes: 0,
        })
        .collect();

    for chunk in directory.chunks() {
        match loads.iter_mut().find(|l| l.shard == chunk.shard) {
            Some(load) => {
                load.chunks += 1;
                load.bytes += chunk.size_bytes;
            }
            None => loads.push(ShardLoad {
                shard: chunk.shard.clone(),
                chunks: 1,
                bytes: chunk.size_bytes,
            }),
        }
    }
    loads.sort_by(|a, b| a.shard.cmp(&b.shard));
    loads
}

/// Effective metric: byte size is only usable once some chunk reports a size
pub fn effective_metric(metric: LoadMetric, loads: &[ShardLoad]) -> LoadMetric {
    match metric {
        LoadMetric::DataSize if loads.iter().all(|l| l.bytes == 0) => LoadMetric::ChunkCount,
        m => m,
    }
}

fn compare(metric: LoadMetric, a: &ShardLoad, b: &ShardLoad) -> Ordering {
    match metric {
        LoadMetric::DataSize => (a.bytes, a.chunks).cmp(&(b.bytes, b.chunks)),
        LoadMetric::ChunkCount => a.chunks.cmp(&b.chunks),
    }
}

fn primary(metric: LoadMetric, load: &ShardLoad) -> u64 {
    match metric {
        LoadMetric::DataSize => load.bytes,
        LoadMetric::ChunkCount => load.chunks,
    }
}

/// Most and least loaded shard, if their gap reaches the threshold
///
/// Under `DataSize` the threshold is `imbalance_threshold` chunk sizes worth
/// of bytes, under `ChunkCount` it is `imbalance_threshold` chunks. Equal
/// loads resolve to the smallest shard id on both ends.
pub fn find_imbalance(
    loads: &[ShardLoad],
    metric: LoadMetric,
    imbalance_threshold: u64,
    chunk_size_bytes: u64,
) -> Option<Imbalance> {
    let metric = effective_metric(metric, loads);

    let mut most: Option<&ShardLoad> = None;
    let mut least: Option<&ShardLoad> = None;
    // `loads` is sorted by shard id, so strict comparisons keep the smallest id
    for load in loads {
        if most.map_or(true, |m| compare(metric, load, m) == Ordering::Greater) {
            most = Some(load);
        }
        if least.map_or(true, |l| compare(metric, load, l) == Ordering::Less) {
            least = Some(load);
        }
    }
    let (most, least) = (most?, least?);
    if most.shard == least.shard {
        return None;
    }

    let gap = primary(metric, most).saturating_sub(primary(metric, least));
    let threshold = match metric {
        LoadMetric::DataSize => imbalance_threshold.saturating_mul(chunk_size_bytes),
        LoadMetric::ChunkCount => imbalance_threshold,
    };
    if gap == 0 || gap < threshold {
        return None;
    }

    Some(Imbalance {
        from: most.shard.clone(),
        to: least.shard.clone(),
        gap,
    })
}

/// Choose a chunk on `from` to hand to the owner of `to`
///
/// Prefers a chunk bordering one of `to`'s ranges so each shard's ranges
/// stay contiguous; otherwise the first chunk not already migrating.
pub fn pick_chunk<'a>(from: &[&'a Chunk], to: &[&Chunk]) -> Option<&'a Chunk> {
    let eligible = || from.iter().copied().filter(|c| !c.migrating);

    eligible()
        .find(|c| to.iter().any(|t| c.max == t.min || c.min == t.max))
        .or_else(|| eligible().next())
}
