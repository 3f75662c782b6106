use anyhow::Result;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use shardgate::config::{default_config_path, expand_tilde, parse_config_servers};
use shardgate::{Config, MemoryMetadataStore, Router};
use shardgate_balancer::Balancer;
use shardgate_server::{
    admin_router, client_router, init_tracing, seed_store, spawn_client_reaper, AdminState,
    HttpTransport,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "shardgate-server")]
#[command(about = "Routing tier and chunk balancer for a sharded data store")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Comma separated metadata store endpoints (one or three)
    #[arg(long)]
    configdb: Option<String>,

    /// Maximum chunk size in megabytes
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Client-facing port
    #[arg(short, long)]
    port: Option<u16>,

    /// Admin API listen address
    #[arg(long)]
    admin_addr: Option<String>,

    /// Log level when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Do not run the balancer in this process
    #[arg(long)]
    no_balancer: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(raw) = &self.configdb {
            config.config_servers = parse_config_servers(raw);
        }
        if let Some(mb) = self.chunk_size {
            config.chunk_size_mb = mb;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(addr) = &self.admin_addr {
            config.server.admin_addr = addr.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.no_balancer {
            config.balancer.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = match &args.config {
        Some(path) => expand_tilde(path)?,
        None => default_config_path(),
    };
    let mut config = Config::load_or_create(&config_path)?;
    args.apply(&mut config);

    init_tracing(&config.logging);
    config.validate()?;

    tracing::info!("Config file: {}", config_path.display());
    tracing::info!(config_servers = ?config.config_servers, "Using metadata store");

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("cannot install metrics recorder: {}", e))?;

    let store = Arc::new(MemoryMetadataStore::new());
    seed_store(&store, &config)?;

    let transport = Arc::new(HttpTransport::new(config.router.shard_timeout())?);
    let router = Arc::new(Router::new(store.clone(), transport, config.router.clone()));
    let reaper = spawn_client_reaper(Arc::clone(router.clients()), config.router.client_idle());

    let balancer = if config.balancer.enabled {
        let identity = Balancer::make_identity(
            &shardgate_server::hostname(),
            config.server.port,
            chrono::Utc::now(),
        );
        Some(Arc::new(Balancer::new(
            identity,
            store.clone(),
            store.clone(),
            config.balancer.clone(),
            config.chunk_size_bytes(),
        )))
    } else {
        tracing::info!("Balancer disabled");
        None
    };
    let balancer_task = balancer
        .as_ref()
        .map(|b| tokio::spawn(Arc::clone(b).run()));

    let admin = admin_router(AdminState {
        stats: Arc::clone(router.stats()),
        balancer: balancer.clone(),
        prometheus: Some(prometheus),
    });
    let client = client_router(Arc::clone(&router));

    let client_addr = format!("{}:{}", config.server.host, config.server.port);
    let client_listener = tokio::net::TcpListener::bind(&client_addr).await?;
    let admin_listener = tokio::net::TcpListener::bind(&config.server.admin_addr).await?;
    tracing::info!("Listening on {}", client_addr);
    tracing::info!("Admin API on {}", config.server.admin_addr);

    let client_server = axum::serve(
        client_listener,
        client.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());
    let admin_server =
        axum::serve(admin_listener, admin).with_graceful_shutdown(shutdown_signal());

    tokio::try_join!(
        async { client_server.await },
        async { admin_server.await }
    )?;

    reaper.abort();
    if let Some(balancer) = &balancer {
        balancer.stop();
    }
    if let Some(task) = balancer_task {
        task.await?;
    }
    tracing::info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
