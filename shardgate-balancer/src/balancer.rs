//! Balancer control loop
//!
//! ```text
//! every period:
//!   stopped?            -> return
//!   ping (lease)        -> held by someone else? skip round
//!   check_oids          -> inconsistent? skip round
//!   for each partitioned collection:
//!     load snapshot -> imbalance >= threshold? -> pick chunk -> migrate
//! ```
//!
//! The lease is a conditional write in the metadata store, so two instances
//! racing in the same window cannot both act. A migration already in flight
//! when `stop()` is called finishes on its own; no new one starts.

use crate::error::{BalancerError, Result};
use crate::metrics;
use crate::policy::{find_imbalance, pick_chunk, shard_loads};
use crate::status::{BalancerStatus, CycleOutcome};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use shardgate::{
    BalancerConfig, LeaseOutcome, LivenessRecord, MetadataStore, MigrationOutcome, Migrator,
    OidCheck, PartitionDirectory, Shard,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

pub struct Balancer {
    identity: String,
    started: DateTime<Utc>,
    store: Arc<dyn MetadataStore>,
    migrator: Arc<dyn Migrator>,
    config: BalancerConfig,
    chunk_size_bytes: u64,
    stopped: AtomicBool,
    wake: Notify,
    status: RwLock<BalancerStatus>,
}

impl Balancer {
    pub fn new(
        identity: impl Into<String>,
        store: Arc<dyn MetadataStore>,
        migrator: Arc<dyn Migrator>,
        config: BalancerConfig,
        chunk_size_bytes: u64,
    ) -> Self {
        let identity = identity.into();
        let started = Utc::now();
        Self {
            status: RwLock::new(BalancerStatus::new(identity.clone(), started)),
            identity,
            started,
            store,
            migrator,
            config,
            chunk_size_bytes,
            stopped: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Process identity written into the liveness record: `host:port:startSecs:rand`
    pub fn make_identity(host: &str, port: u16, started: DateTime<Utc>) -> String {
        format!(
            "{}:{}:{}:{}",
            host,
            port,
            started.timestamp(),
            uuid::Uuid::new_v4().simple()
        )
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    /// Chunks moved in the last round
    pub fn balanced_last_time(&self) -> usize {
        self.status.read().balanced_last_time
    }

    pub fn status(&self) -> BalancerStatus {
        self.status.read().clone()
    }

    /// Request cooperative shutdown; `run` returns at the next round boundary
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run rounds every period until `stop` is called
    pub async fn run(self: Arc<Self>) {
        info!(
            identity = %self.identity,
            period_secs = self.config.period_secs,
            "Balancer started"
        );
        self.status.write().running = true;

        let mut ticker = tokio::time::interval(self.config.period());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            if self.is_stopped() {
                break;
            }
            self.run_cycle().await;
        }

        self.status.write().running = false;
        info!(identity = %self.identity, "Balancer stopped");
    }

    /// One full round: lease, consistency check, then balancing
    pub async fn run_cycle(&self) -> CycleOutcome {
        let outcome = self.cycle().await;

        match &outcome {
            CycleOutcome::Balanced { moved } if *moved > 0 => {
                info!(moved, "Balancer round moved chunks")
            }
            CycleOutcome::Balanced { .. } => debug!("Balancer round found nothing to move"),
            CycleOutcome::NotLeader { holder } => {
                debug!(holder = %holder, "Another balancer holds the lease")
            }
            CycleOutcome::Inconsistent { reason } => {
                warn!(reason = %reason, "Skipping balancer round, chunk identifiers inconsistent")
            }
            CycleOutcome::Failed { error } => warn!(error = %error, "Balancer round failed"),
            CycleOutcome::Stopped => {}
        }

        metrics::record_round(&outcome);
        metrics::record_leader(matches!(
            outcome,
            CycleOutcome::Balanced { .. } | CycleOutcome::Inconsistent { .. }
        ));
        self.status.write().record(&outcome, Utc::now());
        outcome
    }

    async fn cycle(&self) -> CycleOutcome {
        if self.is_stopped() {
            return CycleOutcome::Stopped;
        }

        match self.ping().await {
            Ok(LeaseOutcome::Acquired) => {}
            Ok(LeaseOutcome::HeldBy(record)) => {
                return CycleOutcome::NotLeader { holder: record.who }
            }
            Err(e) => return CycleOutcome::Failed { error: e.to_string() },
        }

        match self.check_oids().await {
            Ok(()) => {}
            Err(BalancerError::InconsistentOids(reason)) => {
                return CycleOutcome::Inconsistent { reason }
            }
            Err(e) => return CycleOutcome::Failed { error: e.to_string() },
        }

        match self.balance().await {
            Ok(moved) => CycleOutcome::Balanced { moved },
            Err(e) => CycleOutcome::Failed { error: e.to_string() },
        }
    }

    /// Write this instance's heartbeat; doubles as the lease acquire
    pub async fn ping(&self) -> Result<LeaseOutcome> {
        let now = Utc::now();
        let record = LivenessRecord {
            who: self.identity.clone(),
            ping: now,
            up_secs: now.signed_duration_since(self.started).num_seconds(),
        };
        Ok(self
            .store
            .write_liveness_record(&record, self.config.lease())
            .await?)
    }

    /// Whether this instance holds the lease after pinging
    pub async fn should_i_balance(&self) -> Result<bool> {
        Ok(matches!(self.ping().await?, LeaseOutcome::Acquired))
    }

    pub async fn check_oids(&self) -> Result<()> {
        match self.store.check_oids().await? {
            OidCheck::Consistent => Ok(()),
            OidCheck::Inconsistent(reason) => Err(BalancerError::InconsistentOids(reason)),
        }
    }

    /// Move at most one chunk per partitioned collection
    ///
    /// Returns the number of collections that had a chunk moved. A failure
    /// on one collection is logged and the others still get their turn.
    pub async fn balance(&self) -> Result<usize> {
        let namespaces = self.store.list_partitioned().await?;
        let shards = self.store.load_shards().await?;

        let mut moved = 0;
        for ns in namespaces {
            if self.is_stopped() {
                debug!("Shutdown requested, not starting further migrations");
                break;
            }
            match self.balance_collection(&ns, &shards).await {
                Ok(true) => moved += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    ns = %ns,
                    error = %e,
                    error_type = e.error_type(),
                    "Could not balance collection"
                ),
            }
        }
        Ok(moved)
    }

    async fn balance_collection(&self, ns: &str, shards: &[Shard]) -> Result<bool> {
        let Some(state) = self.store.load_sharding_state(ns).await? else {
            return Ok(false);
        };
        let Some(shard_key) = state.shard_key else {
            return Ok(false);
        };
        let chunks = self.store.load_chunks(ns).await?;
        let directory = PartitionDirectory::build(ns, shard_key, chunks, state.version).map_err(
            |e| BalancerError::Directory {
                ns: ns.to_string(),
                reason: e.to_string(),
            },
        )?;

        let loads = shard_loads(shards.iter().map(|s| s.id.as_str()), &directory);
        let Some(imbalance) = find_imbalance(
            &loads,
            self.config.load_metric,
            self.config.imbalance_threshold,
            self.chunk_size_bytes,
        ) else {
            return Ok(false);
        };

        let from = directory.chunks_on(&imbalance.from);
        let to = directory.chunks_on(&imbalance.to);
        let Some(chunk) = pick_chunk(&from, &to) else {
            debug!(ns = %ns, from = %imbalance.from, "Every candidate chunk is already migrating");
            return Ok(false);
        };
        let target = shards
            .iter()
            .find(|s| s.id == imbalance.to)
            .ok_or_else(|| BalancerError::ShardNotFound(imbalance.to.clone()))?;

        info!(
            ns = %ns,
            chunk = %chunk.id(),
            from = %imbalance.from,
            to = %imbalance.to,
            gap = imbalance.gap,
            "Moving chunk"
        );

        match self.migrator.request_migration(chunk, target).await {
            Ok(MigrationOutcome::Accepted) => {
                metrics::record_migration("accepted");
                self.store
                    .record_migration(&chunk.id(), &imbalance.from, &imbalance.to)
                    .await?;
                Ok(true)
            }
            Ok(MigrationOutcome::Rejected(reason)) => {
                metrics::record_migration("rejected");
                warn!(ns = %ns, chunk = %chunk.id(), reason = %reason, "Migration rejected");
                Ok(false)
            }
            Err(e) => {
                metrics::record_migration("error");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_format() {
        let started = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let id = Balancer::make_identity("router-1", 27017, started);
        let parts: Vec<&str> = id.split(':').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "router-1");
        assert_eq!(parts[1], "27017");
        assert_eq!(parts[2], "1700000000");
        assert_eq!(parts[3].len(), 32);
    }
}
