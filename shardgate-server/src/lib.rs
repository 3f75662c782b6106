//! Shardgate server - process wiring for the router and the balancer
//!
//! Two HTTP listeners: the client-facing data plane (`POST /op`) and the
//! admin API (health, stats, balancer status, Prometheus metrics). Shards are
//! reached over HTTP/JSON through `HttpTransport`; metadata lives in an
//! embedded store seeded from the config file.

pub mod api;
pub mod http_transport;
pub mod reaper;
pub mod seed;
pub mod telemetry;

pub use api::{admin_router, client_router, AdminState};
pub use http_transport::HttpTransport;
pub use reaper::spawn_client_reaper;
pub use seed::seed_store;
pub use telemetry::init_tracing;

/// Host name used in the balancer identity
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
