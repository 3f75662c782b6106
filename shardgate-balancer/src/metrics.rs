//! Balancer observability metrics

use crate::status::CycleOutcome;

/// Record the outcome of one balancer round
pub fn record_round(outcome: &CycleOutcome) {
    metrics::counter!(
        "shardgate_balancer_rounds_total",
        "outcome" => outcome.label(),
    )
    .increment(1);

    if let CycleOutcome::Balanced { moved } = outcome {
        metrics::gauge!("shardgate_balancer_chunks_moved").set(*moved as f64);
    }
}

/// Record the answer to one migration request
pub fn record_migration(status: &str) {
    metrics::counter!(
        "shardgate_migrations_total",
        "status" => status.to_string(),
    )
    .increment(1);
}

/// Whether this instance held the lease in its last round
pub fn record_leader(leader: bool) {
    metrics::gauge!("shardgate_balancer_leader").set(if leader { 1.0 } else { 0.0 });
}
