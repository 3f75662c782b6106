//! HTTP surfaces: the client data plane and the admin API

use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use shardgate::{ClientId, Operation, Reply, RouterStats};
use shardgate_balancer::Balancer;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Client-facing routes. Each client is keyed on its remote port.
pub fn client_router(router: Arc<shardgate::Router>) -> Router {
    Router::new()
        .route("/op", post(handle_op))
        .layer(TraceLayer::new_for_http())
        .with_state(router)
}

async fn handle_op(
    State(router): State<Arc<shardgate::Router>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(op): Json<Operation>,
) -> Json<Reply> {
    let client = ClientId::from_remote_port(addr.port());
    let remote = addr.to_string();
    Json(router.handle(client, Some(&remote), op).await)
}

#[derive(Clone)]
pub struct AdminState {
    pub stats: Arc<RouterStats>,
    pub balancer: Option<Arc<Balancer>>,
    pub prometheus: Option<PrometheusHandle>,
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/balancer", get(balancer_status))
        .route("/metrics", get(prometheus_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn stats(State(state): State<AdminState>) -> Response {
    Json(state.stats.snapshot()).into_response()
}

async fn balancer_status(State(state): State<AdminState>) -> Response {
    match &state.balancer {
        Some(balancer) => Json(balancer.status()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "balancer disabled" })),
        )
            .into_response(),
    }
}

async fn prometheus_metrics(State(state): State<AdminState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
