//! Request routing pipeline
//!
//! A client operation is bound to a collection config snapshot, handed to a
//! strategy (single shard or sharded) and executed. When a shard answers that
//! it does not own the targeted range, the router sleeps with linear backoff,
//! reloads the namespace's config and tries again, up to a fixed number of
//! attempts.

mod strategy;

pub use strategy::{target_shards, ShardedStrategy, SingleShardStrategy, Strategy};

use crate::catalog::{CollectionCache, CollectionConfig};
use crate::client::{ClientContext, ClientId, ClientRegistry};
use crate::config::RouterConfig;
use crate::error::{ErrorDocument, Result, RouterError};
use crate::metadata::MetadataStore;
use crate::registry::RegistryCache;
use crate::stats::{RouterStats, Scope};
use crate::transport::{ShardResponse, Transport};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Kind of client operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Query,
    GetMore,
    Insert,
    Update,
    Delete,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Query => "query",
            OpKind::GetMore => "getmore",
            OpKind::Insert => "insert",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, OpKind::Insert | OpKind::Update | OpKind::Delete)
    }
}

/// An open cursor on one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorHandle {
    pub shard: String,
    pub cursor_id: i64,
}

/// One inbound client operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    /// Target namespace (`db.collection`)
    pub ns: String,
    /// Query, update or delete selector; command body for commands
    #[serde(default)]
    pub filter: Value,
    /// Documents to insert, or the single update document
    #[serde(default)]
    pub documents: Vec<Value>,
    /// Result-count hint
    #[serde(default)]
    pub n_to_return: i32,
    #[serde(default)]
    pub cursor: Option<CursorHandle>,
}

impl Operation {
    fn new(kind: OpKind, ns: impl Into<String>) -> Self {
        Self {
            kind,
            ns: ns.into(),
            filter: Value::Object(Default::default()),
            documents: Vec::new(),
            n_to_return: 0,
            cursor: None,
        }
    }

    pub fn query(ns: impl Into<String>, filter: Value) -> Self {
        Self {
            filter,
            ..Self::new(OpKind::Query, ns)
        }
    }

    /// A command against `db`: a single-result query on `db.$cmd`
    pub fn command(db: &str, body: Value) -> Self {
        Self {
            filter: body,
            n_to_return: -1,
            ..Self::new(OpKind::Query, format!("{}.$cmd", db))
        }
    }

    pub fn insert(ns: impl Into<String>, documents: Vec<Value>) -> Self {
        Self {
            documents,
            ..Self::new(OpKind::Insert, ns)
        }
    }

    pub fn update(ns: impl Into<String>, filter: Value, update: Value) -> Self {
        Self {
            filter,
            documents: vec![update],
            ..Self::new(OpKind::Update, ns)
        }
    }

    pub fn delete(ns: impl Into<String>, filter: Value) -> Self {
        Self {
            filter,
            ..Self::new(OpKind::Delete, ns)
        }
    }

    pub fn get_more(ns: impl Into<String>, cursor: CursorHandle) -> Self {
        Self {
            cursor: Some(cursor),
            ..Self::new(OpKind::GetMore, ns)
        }
    }

    pub fn with_n_to_return(mut self, n: i32) -> Self {
        self.n_to_return = n;
        self
    }

    /// Single-result query on the command namespace
    pub fn is_command(&self) -> bool {
        self.kind == OpKind::Query
            && (self.n_to_return == 1 || self.n_to_return == -1)
            && self.ns.ends_with(".$cmd")
    }
}

/// One shard's answer to a forwarded operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardResult {
    pub shard: String,
    pub response: Value,
}

/// What the client gets back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Ok(Vec<ShardResult>),
    Err(ErrorDocument),
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok(_))
    }
}

/// One processing attempt of an operation
pub struct Request<'a> {
    op: &'a Operation,
    client: Arc<ClientContext>,
    config: Arc<CollectionConfig>,
    attempt: u32,
}

impl<'a> Request<'a> {
    pub fn new(
        op: &'a Operation,
        client: Arc<ClientContext>,
        config: Arc<CollectionConfig>,
        attempt: u32,
    ) -> Self {
        Self {
            op,
            client,
            config,
            attempt,
        }
    }

    pub fn ns(&self) -> &str {
        &self.op.ns
    }

    pub fn op(&self) -> &Operation {
        self.op
    }

    pub fn client(&self) -> &ClientContext {
        &self.client
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn scope(&self) -> Scope {
        if self.config.partitioned {
            Scope::Sharded
        } else {
            Scope::Unsharded
        }
    }

    pub fn primary_shard(&self) -> Result<String> {
        self.config.primary_shard()
    }
}

/// Resolves shard ids and forwards operations, recording touched shards
pub struct Dispatcher {
    store: Arc<dyn MetadataStore>,
    registry: RegistryCache,
    transport: Arc<dyn Transport>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn MetadataStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            store,
            registry: RegistryCache::new(),
            transport,
        }
    }

    pub fn registry(&self) -> &RegistryCache {
        &self.registry
    }

    /// Forward `op` to one shard on behalf of `req`
    pub async fn send(&self, req: &Request<'_>, shard_id: &str, op: &Operation) -> Result<ShardResult> {
        let shard = self.registry.resolve(self.store.as_ref(), shard_id).await?;
        req.client().add_shard(&shard.id);

        match self.transport.forward(&shard, op).await? {
            ShardResponse::Ok(response) => Ok(ShardResult {
                shard: shard.id,
                response,
            }),
            ShardResponse::StaleConfig(reason) => Err(RouterError::StaleConfig {
                ns: op.ns.clone(),
                reason,
            }),
        }
    }

    /// Forward to several shards concurrently
    ///
    /// A stale answer from any shard wins over other failures so the whole
    /// operation is retried against a fresh directory. A write that some
    /// shards already applied is never replayed: it fails with `PartialWrite`.
    pub async fn send_all(
        &self,
        req: &Request<'_>,
        targets: &[(String, Operation)],
    ) -> Result<Vec<ShardResult>> {
        let results = join_all(targets.iter().map(|(shard, op)| self.send(req, shard, op))).await;

        let mut ok = Vec::with_capacity(results.len());
        let mut stale: Option<RouterError> = None;
        let mut failure: Option<RouterError> = None;
        for result in results {
            match result {
                Ok(r) => ok.push(r),
                Err(e) if e.is_stale_config() => {
                    stale.get_or_insert(e);
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        match (stale, failure) {
            (Some(RouterError::StaleConfig { ns, reason }), _)
                if req.op().kind.is_write() && !ok.is_empty() =>
            {
                let applied: Vec<String> = ok.into_iter().map(|r| r.shard).collect();
                warn!(ns = %ns, applied = ?applied, "Stale config after partial write");
                Err(RouterError::PartialWrite {
                    ns,
                    applied,
                    reason,
                })
            }
            (Some(e), _) | (None, Some(e)) => Err(e),
            (None, None) => Ok(ok),
        }
    }
}

/// Per-operation orchestrator with the stale-config retry loop
pub struct Router {
    cache: Arc<CollectionCache>,
    clients: Arc<ClientRegistry>,
    dispatcher: Dispatcher,
    stats: Arc<RouterStats>,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        transport: Arc<dyn Transport>,
        config: RouterConfig,
    ) -> Self {
        Self {
            cache: Arc::new(CollectionCache::new(
                Arc::clone(&store),
                config.default_shard.clone(),
            )),
            clients: Arc::new(ClientRegistry::new()),
            dispatcher: Dispatcher::new(store, transport),
            stats: Arc::new(RouterStats::new()),
            config,
        }
    }

    pub fn cache(&self) -> &Arc<CollectionCache> {
        &self.cache
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub fn stats(&self) -> &Arc<RouterStats> {
        &self.stats
    }

    /// Process one operation from `client_id`, retrying on stale config
    pub async fn process(
        &self,
        client_id: ClientId,
        remote: Option<&str>,
        op: Operation,
    ) -> Result<Vec<ShardResult>> {
        let client = self.resolve_client(client_id)?;
        self.process_for(&client, remote, op).await
    }

    fn resolve_client(&self, client_id: ClientId) -> Result<Arc<ClientContext>> {
        self.clients
            .get(client_id, true)
            .ok_or_else(|| RouterError::InvalidOperation("no client context".into()))
    }

    async fn process_for(
        &self,
        client: &Arc<ClientContext>,
        remote: Option<&str>,
        op: Operation,
    ) -> Result<Vec<ShardResult>> {
        client.new_request(remote)?;

        if op.kind == OpKind::GetMore && op.cursor.is_none() {
            return Err(RouterError::InvalidOperation(format!(
                "getMore on {} without a cursor",
                op.ns
            )));
        }

        let ns = op.ns.clone();
        let mut config = self.cache.get(&ns).await?;
        let mut attempt = 1;

        loop {
            let request = Request::new(&op, Arc::clone(client), Arc::clone(&config), attempt);
            debug!(ns = %ns, op = op.kind.as_str(), attempt, "Processing request");

            match self.execute(&request).await {
                Ok(results) => {
                    self.count(&request);
                    return Ok(results);
                }
                Err(e) if e.is_stale_config() && op.kind != OpKind::GetMore => {
                    if attempt >= self.config.max_attempts {
                        warn!(ns = %ns, attempt, "Giving up after repeated stale config");
                        return Err(RouterError::TooManyRetries {
                            ns,
                            attempts: attempt,
                        });
                    }
                    info!(ns = %ns, attempt, error = %e, "Stale config, reloading");
                    metrics::counter!("shardgate_stale_retries_total").increment(1);

                    tokio::time::sleep(self.config.retry_backoff(attempt)).await;
                    config = self.cache.reload(&ns).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Like `process`, but failures become an error document for the client
    ///
    /// The error is recorded as the last error of the context the operation
    /// ran under. For `ClientId::LOCAL` outside `ClientRegistry::scope_local`
    /// that context is detached, so only the returned reply carries it.
    pub async fn handle(&self, client_id: ClientId, remote: Option<&str>, op: Operation) -> Reply {
        let result = match self.resolve_client(client_id) {
            Ok(client) => {
                let result = self.process_for(&client, remote, op).await;
                if let Err(e) = &result {
                    client.set_last_error(ErrorDocument::from(e));
                }
                result
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(results) => Reply::Ok(results),
            Err(e) => {
                let doc = ErrorDocument::from(&e);
                metrics::counter!("shardgate_errors_total", "type" => e.error_type()).increment(1);
                debug!(code = doc.code, error = %e, "Operation failed");
                Reply::Err(doc)
            }
        }
    }

    async fn execute(&self, req: &Request<'_>) -> Result<Vec<ShardResult>> {
        let strategy: &dyn Strategy = if req.config().partitioned {
            &ShardedStrategy
        } else {
            &SingleShardStrategy
        };

        match req.op().kind {
            OpKind::Query => strategy.query_op(req, &self.dispatcher).await,
            OpKind::GetMore => strategy.get_more(req, &self.dispatcher).await,
            OpKind::Insert | OpKind::Update | OpKind::Delete => {
                strategy.write_op(req, &self.dispatcher).await
            }
        }
    }

    fn count(&self, req: &Request<'_>) {
        let op = req.op();
        let scope = req.scope();
        if op.kind == OpKind::Insert {
            for _ in &op.documents {
                self.stats.got_insert(scope);
            }
        } else {
            self.stats.got_op(scope, op.kind, op.is_command());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_detection() {
        assert!(Operation::command("admin", json!({"ping": 1})).is_command());
        assert!(Operation::query("admin.$cmd", json!({})).with_n_to_return(1).is_command());
        assert!(!Operation::query("admin.$cmd", json!({})).with_n_to_return(2).is_command());
        assert!(!Operation::query("db.users", json!({})).with_n_to_return(-1).is_command());
    }

    #[test]
    fn test_command_suffix_must_end_namespace() {
        let op = Operation::query("db.$cmd.log", json!({})).with_n_to_return(1);
        assert!(!op.is_command());
    }

    #[test]
    fn test_reply_serializes_error_document() {
        let reply = Reply::Err(ErrorDocument::from(&RouterError::NoPrimaryShard("a.b".into())));
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["code"], 10194);
        assert!(!reply.is_ok());
    }

    #[test]
    fn test_op_kind_labels() {
        assert_eq!(OpKind::GetMore.as_str(), "getmore");
        assert!(OpKind::Delete.is_write());
        assert!(!OpKind::Query.is_write());
    }
}
