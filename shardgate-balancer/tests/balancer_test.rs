//! Balancer integration tests against the embedded metadata store

use shardgate::{
    BalancerConfig, KeyValue, LivenessRecord, LoadMetric, MemoryMetadataStore, ShardKeyPattern,
};
use shardgate_balancer::{Balancer, CycleOutcome};
use std::sync::Arc;
use std::time::Duration;

fn config() -> BalancerConfig {
    BalancerConfig {
        load_metric: LoadMetric::ChunkCount,
        ..Default::default()
    }
}

/// `db.users` split into `n` chunks, all owned by s1
fn store_with_chunks(n: i64) -> Arc<MemoryMetadataStore> {
    let store = Arc::new(MemoryMetadataStore::new());
    store.add_shard("s1", "127.0.0.1:27018");
    store.add_shard("s2", "127.0.0.1:27019");
    store.shard_collection("db.users", ShardKeyPattern::new("uid"), "s1").unwrap();
    for i in 1..n {
        store.split("db.users", &KeyValue::Int(i * 100)).unwrap();
    }
    store
}

fn balancer(name: &str, store: &Arc<MemoryMetadataStore>) -> Balancer {
    Balancer::new(name, store.clone(), store.clone(), config(), 64 * 1024 * 1024)
}

fn owners(store: &MemoryMetadataStore) -> Vec<String> {
    store.chunks("db.users").into_iter().map(|c| c.shard).collect()
}

#[tokio::test]
async fn test_moves_one_chunk_toward_empty_shard() {
    let store = store_with_chunks(4);
    let balancer = balancer("a", &store);

    let outcome = balancer.run_cycle().await;
    assert_eq!(outcome, CycleOutcome::Balanced { moved: 1 });
    assert_eq!(balancer.balanced_last_time(), 1);

    // s2 owns nothing yet, so the first eligible chunk goes
    assert_eq!(owners(&store), vec!["s2", "s1", "s1", "s1"]);

    let log = store.migrations();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].from, "s1");
    assert_eq!(log[0].to, "s2");
    assert_eq!(store.liveness_record().unwrap().who, "a");
}

#[tokio::test]
async fn test_gap_within_threshold_never_migrates() {
    let store = store_with_chunks(3);
    store.move_chunk("db.users", &KeyValue::Int(200), "s2").unwrap();
    let balancer = balancer("a", &store);

    // s1 holds 2 chunks, s2 holds 1
    let outcome = balancer.run_cycle().await;
    assert_eq!(outcome, CycleOutcome::Balanced { moved: 0 });
    assert!(store.migrations().is_empty());
}

#[tokio::test]
async fn test_repeated_rounds_converge() {
    let store = store_with_chunks(6);
    let balancer = balancer("a", &store);

    for _ in 0..5 {
        balancer.run_cycle().await;
    }
    assert_eq!(store.migrations().len(), 3);
    // Later moves pick chunks bordering s2's range, keeping it contiguous
    assert_eq!(owners(&store), vec!["s2", "s2", "s2", "s1", "s1", "s1"]);
}

#[tokio::test]
async fn test_racing_balancers_only_one_acts() {
    let store = store_with_chunks(4);
    let a = balancer("a", &store);
    let b = balancer("b", &store);

    let (ra, rb) = tokio::join!(a.run_cycle(), b.run_cycle());

    let acted = [&ra, &rb]
        .iter()
        .filter(|o| matches!(o, CycleOutcome::Balanced { .. }))
        .count();
    let skipped = [&ra, &rb]
        .iter()
        .filter(|o| matches!(o, CycleOutcome::NotLeader { .. }))
        .count();
    assert_eq!(acted, 1);
    assert_eq!(skipped, 1);
    assert_eq!(store.migrations().len(), 1);

    // The loser keeps backing off while the lease is fresh
    let (leader, follower) = if ra.moved() == 1 { (&a, &b) } else { (&b, &a) };
    assert_eq!(
        follower.run_cycle().await,
        CycleOutcome::NotLeader {
            holder: leader.identity().to_string()
        }
    );
    assert!(leader.status().leader);
    assert!(!follower.status().leader);
}

#[tokio::test]
async fn test_expired_lease_is_taken_over() {
    let store = store_with_chunks(4);
    store.set_liveness_record(Some(LivenessRecord {
        who: "dead-router:27017:1:abc".into(),
        ping: chrono::Utc::now() - chrono::Duration::seconds(3600),
        up_secs: 10,
    }));
    let balancer = balancer("a", &store);

    assert!(balancer.should_i_balance().await.unwrap());
    assert_eq!(store.liveness_record().unwrap().who, "a");
}

#[tokio::test]
async fn test_unreachable_store_skips_round() {
    let store = store_with_chunks(4);
    store.set_available(false);
    let balancer = balancer("a", &store);

    let outcome = balancer.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Failed { .. }));
    assert!(balancer.status().last_error.is_some());

    store.set_available(true);
    assert!(store.migrations().is_empty());
    assert_eq!(balancer.run_cycle().await.moved(), 1);
}

#[tokio::test]
async fn test_inconsistent_oids_skip_round() {
    let store = store_with_chunks(4);
    store.set_oids_consistent(false);
    let balancer = balancer("a", &store);

    let outcome = balancer.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Inconsistent { .. }));
    assert!(store.migrations().is_empty());
    assert_eq!(owners(&store), vec!["s1"; 4]);
}

#[tokio::test]
async fn test_corrupt_chunk_list_skips_round() {
    let store = store_with_chunks(4);
    let mut chunks = store.chunks("db.users");
    chunks.remove(2);
    store.set_chunks("db.users", chunks).unwrap();
    let balancer = balancer("a", &store);

    let outcome = balancer.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Inconsistent { .. }));
    assert!(store.migrations().is_empty());
    assert!(balancer.status().last_error.is_some());
}

#[tokio::test]
async fn test_rejected_migration_is_not_fatal() {
    let store = store_with_chunks(4);
    store.set_accept_migrations(false);
    let balancer = balancer("a", &store);

    assert_eq!(balancer.run_cycle().await, CycleOutcome::Balanced { moved: 0 });
    assert!(store.migrations().is_empty());

    store.set_accept_migrations(true);
    assert_eq!(balancer.run_cycle().await, CycleOutcome::Balanced { moved: 1 });
}

#[tokio::test]
async fn test_migrating_chunks_are_skipped() {
    let store = store_with_chunks(4);
    store.set_migrating("db.users", &KeyValue::MinKey, true).unwrap();
    let balancer = balancer("a", &store);

    balancer.run_cycle().await;
    assert_eq!(owners(&store), vec!["s1", "s2", "s1", "s1"]);
}

#[tokio::test]
async fn test_stop_before_round() {
    let store = store_with_chunks(4);
    let balancer = balancer("a", &store);
    balancer.stop();

    assert_eq!(balancer.run_cycle().await, CycleOutcome::Stopped);
    assert!(store.migrations().is_empty());
    assert!(store.liveness_record().is_none());
}

#[tokio::test]
async fn test_run_returns_after_stop() {
    let store = store_with_chunks(4);
    let balancer = Arc::new(Balancer::new(
        "a",
        store.clone(),
        store.clone(),
        BalancerConfig {
            period_secs: 3600,
            ..config()
        },
        64 * 1024 * 1024,
    ));

    let handle = tokio::spawn(Arc::clone(&balancer).run());
    // First tick fires immediately
    tokio::time::timeout(Duration::from_secs(5), async {
        while balancer.status().rounds == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    balancer.stop();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    assert!(!balancer.status().running);
    assert_eq!(balancer.status().rounds, 1);
    assert_eq!(store.migrations().len(), 1);
}
