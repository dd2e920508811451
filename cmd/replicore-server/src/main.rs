use clap::{Parser, ValueEnum};
use pkg_api::server::{ServerConfig, start_server};
use pkg_constants::controller::{
    DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_MAX_SECS, DEFAULT_MAX_CONFLICT_RETRIES,
    DEFAULT_RESYNC_INTERVAL_SECS, DEFAULT_WORKERS,
};
use pkg_constants::network::{DEFAULT_API_PORT, DEFAULT_BIND_ADDR};
use pkg_constants::paths::DEFAULT_SERVER_CONFIG;
use pkg_constants::scheduler::{DEFAULT_NODE_NAME, DEFAULT_SCHEDULER_RETRY_SECS};
use pkg_controllers::ControllerConfig;
use pkg_types::config::{ServerConfigFile, load_config_file, load_manifests};
use pkg_types::node::Node;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "replicore-server", about = "ReplicaSet reconciliation server")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_SERVER_CONFIG)]
    config: String,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Number of reconcile workers
    #[arg(long)]
    workers: Option<usize>,

    /// Seconds between full resyncs
    #[arg(long)]
    resync_interval_secs: Option<u64>,

    /// YAML file with ReplicaSets to create at startup
    #[arg(long)]
    manifests: Option<String>,

    /// Log output format (filter with RUST_LOG)
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    // Load config file (returns defaults if file not found)
    let file_cfg: ServerConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);

    // Merge: CLI args > config file > defaults
    let port = cli.port.or(file_cfg.port).unwrap_or(DEFAULT_API_PORT);
    let controller = ControllerConfig {
        workers: cli.workers.or(file_cfg.workers).unwrap_or(DEFAULT_WORKERS),
        resync_interval: Duration::from_secs(
            cli.resync_interval_secs
                .or(file_cfg.resync_interval_secs)
                .unwrap_or(DEFAULT_RESYNC_INTERVAL_SECS),
        ),
        backoff_base: Duration::from_millis(
            file_cfg.backoff_base_ms.unwrap_or(DEFAULT_BACKOFF_BASE_MS),
        ),
        backoff_max: Duration::from_secs(
            file_cfg.backoff_max_secs.unwrap_or(DEFAULT_BACKOFF_MAX_SECS),
        ),
        max_conflict_retries: file_cfg
            .max_conflict_retries
            .unwrap_or(DEFAULT_MAX_CONFLICT_RETRIES),
    };
    let scheduler_retry = Duration::from_secs(
        file_cfg
            .scheduler_retry_secs
            .unwrap_or(DEFAULT_SCHEDULER_RETRY_SECS),
    );
    let nodes = if file_cfg.nodes.is_empty() {
        vec![Node::new(DEFAULT_NODE_NAME)]
    } else {
        file_cfg.nodes
    };
    let manifests = match cli.manifests.or(file_cfg.manifests) {
        Some(path) => load_manifests(&path)?,
        None => Vec::new(),
    };

    info!("Starting replicore-server");
    info!("  Port:      {}", port);
    info!("  Workers:   {}", controller.workers);
    info!("  Resync:    {}s", controller.resync_interval.as_secs());
    info!("  Nodes:     {}", nodes.len());
    info!("  Manifests: {}", manifests.len());

    let config = ServerConfig {
        addr: SocketAddr::from((DEFAULT_BIND_ADDR, port)),
        controller,
        scheduler_retry,
        nodes,
        manifests,
    };

    start_server(config, shutdown_signal()).await?;

    Ok(())
}
