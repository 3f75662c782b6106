//! Shardgate Balancer - cluster-wide single-instance chunk balancer
//!
//! A background loop that periodically moves one chunk per partitioned
//! collection from the most loaded shard to the least loaded one.
//!
//! # Architecture
//!
//! - **Balancer**: the control loop, lease handling and migration issue
//! - **Policy**: shard load snapshot, hysteresis threshold, chunk choice
//! - **Status**: per-round outcome and the status snapshot for the admin API
//!
//! Only the instance holding the liveness lease in the metadata store acts in
//! a given round; every other instance skips it.

pub mod balancer;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod status;

pub use balancer::Balancer;
pub use error::BalancerError;
pub use policy::{find_imbalance, pick_chunk, shard_loads, Imbalance, ShardLoad};
pub use status::{BalancerStatus, CycleOutcome};
