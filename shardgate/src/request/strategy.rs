//! Routing strategies
//!
//! `SingleShardStrategy` forwards everything to the namespace's one owner.
//! `ShardedStrategy` targets the chunks a shard key (or key range) selects and
//! broadcasts when the selector carries no usable key.

use super::{Dispatcher, OpKind, Operation, Request, ShardResult};
use crate::directory::PartitionDirectory;
use crate::error::{Result, RouterError};
use crate::key::{KeyValue, ShardKeyPattern};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

#[async_trait]
pub trait Strategy: Send + Sync {
    async fn query_op(&self, req: &Request<'_>, dispatcher: &Dispatcher)
        -> Result<Vec<ShardResult>>;

    /// Continue an open cursor on the shard that owns it
    async fn get_more(&self, req: &Request<'_>, dispatcher: &Dispatcher)
        -> Result<Vec<ShardResult>> {
        let cursor = req.op().cursor.as_ref().ok_or_else(|| {
            RouterError::InvalidOperation(format!("getMore on {} without a cursor", req.ns()))
        })?;
        let result = dispatcher.send(req, &cursor.shard, req.op()).await?;
        Ok(vec![result])
    }

    async fn write_op(&self, req: &Request<'_>, dispatcher: &Dispatcher)
        -> Result<Vec<ShardResult>>;
}

pub struct SingleShardStrategy;

impl SingleShardStrategy {
    async fn forward_to_primary(
        &self,
        req: &Request<'_>,
        dispatcher: &Dispatcher,
    ) -> Result<Vec<ShardResult>> {
        let shard = req.primary_shard()?;
        let result = dispatcher.send(req, &shard, req.op()).await?;
        Ok(vec![result])
    }
}

#[async_trait]
impl Strategy for SingleShardStrategy {
    async fn query_op(&self, req: &Request<'_>, dispatcher: &Dispatcher)
        -> Result<Vec<ShardResult>> {
        self.forward_to_primary(req, dispatcher).await
    }

    async fn write_op(&self, req: &Request<'_>, dispatcher: &Dispatcher)
        -> Result<Vec<ShardResult>> {
        self.forward_to_primary(req, dispatcher).await
    }
}

pub struct ShardedStrategy;

impl ShardedStrategy {
    fn directory<'r>(req: &'r Request<'_>) -> Result<&'r PartitionDirectory> {
        req.config()
            .directory
            .as_deref()
            .ok_or_else(|| RouterError::NoShardInfo(req.ns().to_string()))
    }

    /// Same operation to every shard the selector targets
    async fn scatter(&self, req: &Request<'_>, dispatcher: &Dispatcher)
        -> Result<Vec<ShardResult>> {
        let directory = Self::directory(req)?;
        let targets: Vec<(String, Operation)> = target_shards(directory, &req.op().filter)
            .into_iter()
            .map(|shard| (shard, req.op().clone()))
            .collect();
        dispatcher.send_all(req, &targets).await
    }

    /// Each document goes to the shard owning its key
    async fn insert(&self, req: &Request<'_>, dispatcher: &Dispatcher)
        -> Result<Vec<ShardResult>> {
        let directory = Self::directory(req)?;
        let pattern = directory.shard_key();

        let mut by_shard: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for doc in &req.op().documents {
            let key = pattern.extract(doc).ok_or_else(|| {
                RouterError::InvalidOperation(format!(
                    "tried to insert object without shard key {} into {}",
                    pattern.field,
                    req.ns()
                ))
            })?;
            let chunk = directory.find_chunk(&key)?;
            by_shard.entry(chunk.shard.clone()).or_default().push(doc.clone());
        }

        let targets: Vec<(String, Operation)> = by_shard
            .into_iter()
            .map(|(shard, documents)| (shard, Operation::insert(req.ns(), documents)))
            .collect();
        dispatcher.send_all(req, &targets).await
    }
}

#[async_trait]
impl Strategy for ShardedStrategy {
    async fn query_op(&self, req: &Request<'_>, dispatcher: &Dispatcher)
        -> Result<Vec<ShardResult>> {
        self.scatter(req, dispatcher).await
    }

    async fn write_op(&self, req: &Request<'_>, dispatcher: &Dispatcher)
        -> Result<Vec<ShardResult>> {
        match req.op().kind {
            OpKind::Insert => self.insert(req, dispatcher).await,
            OpKind::Update | OpKind::Delete => self.scatter(req, dispatcher).await,
            kind => Err(RouterError::InvalidOperation(format!(
                "{} is not a write",
                kind.as_str()
            ))),
        }
    }
}

/// Shards a selector can touch: the owners of the key's chunks, or all of them
pub fn target_shards(directory: &PartitionDirectory, filter: &Value) -> BTreeSet<String> {
    match key_range(directory.shard_key(), filter) {
        Some((min, max)) => directory
            .chunks_for_range(&min, &max)
            .into_iter()
            .map(|c| c.shard.clone())
            .collect(),
        None => directory.shards(),
    }
}

/// Inclusive key range implied by a selector on the shard key field
///
/// Exclusive bounds widen to inclusive ones, which can only add targets.
fn key_range(pattern: &ShardKeyPattern, filter: &Value) -> Option<(KeyValue, KeyValue)> {
    let cond = filter.get(&pattern.field)?;
    if let Some(key) = KeyValue::from_json(cond) {
        return Some((key.clone(), key));
    }

    let ops = cond.as_object()?;
    let mut min = pattern.global_min();
    let mut max = pattern.global_max();
    let mut bounded = false;
    for (op, value) in ops {
        let key = KeyValue::from_json(value)?;
        match op.as_str() {
            "$eq" => return Some((key.clone(), key)),
            "$gt" | "$gte" => min = key,
            "$lt" | "$lte" => max = key,
            _ => return None,
        }
        bounded = true;
    }
    bounded.then_some((min, max))
}
