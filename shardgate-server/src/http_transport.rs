//! HTTP/JSON shard transport
//!
//! Each shard exposes `POST /shard/op` taking an `Operation`. A 2xx answer
//! carries the result document. `409 Conflict` with `{"stale": "<reason>"}`
//! means the shard does not own the targeted range at its current version.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shardgate::{Operation, RouterError, Shard, ShardResponse, Transport};
use std::time::Duration;
use tracing::debug;

/// Body of a `409 Conflict` answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleBody {
    pub stale: String,
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> shardgate::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RouterError::Transport(format!("cannot build http client: {}", e)))?;
        Ok(Self { client })
    }

    fn url(shard: &Shard) -> String {
        if shard.endpoint.starts_with("http://") || shard.endpoint.starts_with("https://") {
            format!("{}/shard/op", shard.endpoint.trim_end_matches('/'))
        } else {
            format!("http://{}/shard/op", shard.endpoint)
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn forward(&self, shard: &Shard, op: &Operation) -> shardgate::Result<ShardResponse> {
        let response = self
            .client
            .post(Self::url(shard))
            .json(op)
            .send()
            .await
            .map_err(|e| RouterError::Transport(format!("{}: {}", shard.id, e)))?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            let body: StaleBody = response
                .json()
                .await
                .map_err(|e| RouterError::Transport(format!("{}: bad stale body: {}", shard.id, e)))?;
            debug!(shard = %shard.id, reason = %body.stale, "Shard reported stale config");
            return Ok(ShardResponse::StaleConfig(body.stale));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RouterError::Transport(format!(
                "{} returned {}: {}",
                shard.id, status, text
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| RouterError::Transport(format!("{}: bad response body: {}", shard.id, e)))?;
        Ok(ShardResponse::Ok(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_accepts_bare_and_schemed_endpoints() {
        assert_eq!(
            HttpTransport::url(&Shard::new("s1", "127.0.0.1:28001")),
            "http://127.0.0.1:28001/shard/op"
        );
        assert_eq!(
            HttpTransport::url(&Shard::new("s1", "https://shard-a/")),
            "https://shard-a/shard/op"
        );
    }
}
