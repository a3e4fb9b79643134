use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use rookery_xmpp::cluster::MemoryKv;
use rookery_xmpp::storage::{LibSqlRepository, MemoryRepository, Repository};
use rookery_xmpp::{ServerParts, XmppServer};
use tracing::{error, info};

mod config;
mod telemetry;

use config::{ServerConfig, StorageConfig, StorageKind};
use telemetry::LogFormat;

/// Rookery XMPP server.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "ROOKERY_CONFIG")]
    config: Option<PathBuf>,

    /// Console log format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Install the ring crypto provider for rustls
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    telemetry::init(cli.log_format)?;

    info!("Rookery starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load(cli.config.as_deref())
        .context("Failed to load server configuration")?;
    config.log_config();

    let repository = open_storage(&config.storage).await?;
    let kv = Arc::new(MemoryKv::with_capacity(config.cluster.watch_capacity));
    let server = XmppServer::new(
        config.instance_id.clone(),
        config.xmpp.clone(),
        ServerParts::standalone(repository, kv),
    )
    .context("Failed to build XMPP server")?;
    server.start().await.context("Failed to start XMPP server")?;

    let session_lost = server.session_lost();
    let result = tokio::select! {
        _ = shutdown_signal() => Ok(()),
        _ = session_lost.cancelled() => {
            error!("Cluster KV session lost, shutting down");
            Err(anyhow!("cluster KV session lost"))
        }
    };

    server.stop(config.shutdown_timeout).await;
    telemetry::shutdown();
    result
}

async fn open_storage(config: &StorageConfig) -> Result<Arc<dyn Repository>> {
    let repository: Arc<dyn Repository> = match config.kind {
        StorageKind::Memory => {
            info!("Using in-memory storage (development mode)");
            Arc::new(MemoryRepository::new())
        }
        StorageKind::Libsql => {
            info!(path = %config.path.display(), "Using libsql storage");
            let repository = LibSqlRepository::open(&config.path)
                .await
                .with_context(|| format!("Failed to open database {}", config.path.display()))?;
            Arc::new(repository)
        }
    };
    Ok(repository)
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
