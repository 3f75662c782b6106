//! Periodic eviction of idle client contexts
//!
//! The HTTP front never sees a connection close, so a context keyed on a
//! remote port lives until it has been idle for the configured window.

use shardgate::ClientRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Reap every `max_idle`; the first pass runs immediately
pub fn spawn_client_reaper(clients: Arc<ClientRegistry>, max_idle: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(max_idle);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reaped = clients.reap_idle(max_idle);
            if reaped > 0 {
                debug!(reaped, remaining = clients.len(), "Evicted idle client contexts");
            }
        }
    })
}
