//! Configuration management for the router and balancer
//!
//! Default config location: ~/.shardgate/config.toml

use crate::error::RouterError;
use crate::key::KeyValue;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Metadata store endpoints: one node or a three node quorum
    #[serde(default = "default_config_servers")]
    pub config_servers: Vec<String>,
    /// Maximum chunk size in megabytes
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Shards to register in the embedded metadata store
    #[serde(default)]
    pub shards: Vec<ShardSeed>,
    /// Collections to create in the embedded metadata store
    #[serde(default)]
    pub collections: Vec<CollectionSeed>,
}

fn default_config_servers() -> Vec<String> {
    vec!["127.0.0.1:27019".to_string()]
}

fn default_chunk_size_mb() -> u64 {
    200
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            config_servers: default_config_servers(),
            chunk_size_mb: default_chunk_size_mb(),
            router: RouterConfig::default(),
            balancer: BalancerConfig::default(),
            logging: LoggingConfig::default(),
            shards: Vec::new(),
            collections: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Client-facing listen host
    #[serde(default = "default_host")]
    pub host: String,
    /// Admin HTTP listener (health, stats, metrics)
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,
    /// Client-facing port, also part of the balancer identity
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_addr() -> String {
    "127.0.0.1:27080".to_string()
}

fn default_port() -> u16 {
    27017
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            admin_addr: default_admin_addr(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterConfig {
    /// Total attempts for one operation, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff, multiplied by the attempt number
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Shard serving namespaces the metadata store does not know
    #[serde(default)]
    pub default_shard: Option<String>,
    /// Per-request timeout when forwarding to a shard
    #[serde(default = "default_shard_timeout_ms")]
    pub shard_timeout_ms: u64,
    /// Client contexts unused for this long are evicted
    #[serde(default = "default_client_idle_secs")]
    pub client_idle_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_shard_timeout_ms() -> u64 {
    30_000
}

fn default_client_idle_secs() -> u64 {
    600
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            default_shard: None,
            shard_timeout_ms: default_shard_timeout_ms(),
            client_idle_secs: default_client_idle_secs(),
        }
    }
}

impl RouterConfig {
    /// Sleep before the retry following `attempt`
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(attempt as u64))
    }

    pub fn shard_timeout(&self) -> Duration {
        Duration::from_millis(self.shard_timeout_ms)
    }

    pub fn client_idle(&self) -> Duration {
        Duration::from_secs(self.client_idle_secs)
    }
}

/// How the balancer measures shard load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadMetric {
    /// Bytes owned, chunk count breaks ties
    #[default]
    DataSize,
    ChunkCount,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BalancerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between cycles
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    /// Lease expires after `period * lease_multiplier`
    #[serde(default = "default_lease_multiplier")]
    pub lease_multiplier: u32,
    /// Minimum gap before a chunk moves, in chunks or in chunk-size units
    #[serde(default = "default_imbalance_threshold")]
    pub imbalance_threshold: u64,
    #[serde(default)]
    pub load_metric: LoadMetric,
}

fn default_true() -> bool {
    true
}

fn default_period_secs() -> u64 {
    10
}

fn default_lease_multiplier() -> u32 {
    3
}

fn default_imbalance_threshold() -> u64 {
    2
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period_secs: default_period_secs(),
            lease_multiplier: default_lease_multiplier(),
            imbalance_threshold: default_imbalance_threshold(),
            load_metric: LoadMetric::default(),
        }
    }
}

impl BalancerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn lease(&self) -> Duration {
        self.period() * self.lease_multiplier
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    /// `plain` or `json`
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "plain".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShardSeed {
    pub id: String,
    pub endpoint: String,
}

/// A split point as written in TOML: a bare integer or string
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SplitPoint {
    Int(i64),
    Str(String),
}

impl From<SplitPoint> for KeyValue {
    fn from(point: SplitPoint) -> Self {
        match point {
            SplitPoint::Int(i) => KeyValue::Int(i),
            SplitPoint::Str(s) => KeyValue::Str(s),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectionSeed {
    pub ns: String,
    /// Owner shard; for partitioned collections the owner of the initial chunk
    pub primary: String,
    /// Shard key field; absent means unpartitioned
    #[serde(default)]
    pub shard_key: Option<String>,
    #[serde(default)]
    pub split_points: Vec<SplitPoint>,
}

pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".shardgate")
        .join("config.toml")
}

/// Expand ~ to home directory
pub fn expand_tilde(path: &Path) -> Result<PathBuf> {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
        Ok(home.join(rest))
    } else {
        Ok(path.to_path_buf())
    }
}

/// Split a comma separated `--configdb` value into endpoints
pub fn parse_config_servers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    /// Load config from file path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let path = expand_tilde(config_path)?;
        let content = fs::read_to_string(&path)
            .map_err(|e| anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load config from file path, or create default
    pub fn load_or_create(config_path: &Path) -> Result<Self> {
        let path = expand_tilde(config_path)?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Config::default();
            // Try to save default config
            let _ = config.save(&path);
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mb * 1024 * 1024
    }

    /// Check the topology and tunables before anything starts
    pub fn validate(&self) -> std::result::Result<(), RouterError> {
        match self.config_servers.len() {
            1 | 3 => {}
            n => {
                return Err(RouterError::Config(format!(
                    "need either 1 or 3 configdbs, got {}",
                    n
                )))
            }
        }
        if self.chunk_size_mb == 0 {
            return Err(RouterError::Config("chunk size must be positive".into()));
        }
        if self.router.max_attempts == 0 {
            return Err(RouterError::Config("router.max_attempts must be at least 1".into()));
        }
        if self.router.client_idle_secs == 0 {
            return Err(RouterError::Config("router.client_idle_secs must be positive".into()));
        }
        if self.balancer.period_secs == 0 || self.balancer.lease_multiplier == 0 {
            return Err(RouterError::Config(
                "balancer period and lease multiplier must be positive".into(),
            ));
        }
        for collection in &self.collections {
            if !self.shards.iter().any(|s| s.id == collection.primary) {
                return Err(RouterError::Config(format!(
                    "collection {} names unknown shard {}",
                    collection.ns, collection.primary
                )));
            }
            if collection.shard_key.is_none() && !collection.split_points.is_empty() {
                return Err(RouterError::Config(format!(
                    "collection {} has split points but no shard key",
                    collection.ns
                )));
            }
        }
        Ok(())
    }
}
