//! edge-gateway
//!
//! A protocol-adaptive reverse proxy built with Tokio and Axum.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────────────┐
//!                        │                    EDGE GATEWAY                      │
//!   Client Request       │  ┌──────────┐   ┌──────────┐   ┌────────────────┐    │
//!   ─────────────────────┼─▶│ http     │──▶│ routing  │──▶│ security       │    │
//!   /{host}[:port]/path  │  │ server   │   │ target   │   │ access / bot   │    │
//!                        │  └──────────┘   └──────────┘   └───────┬────────┘    │
//!                        │                                        ▼             │
//!                        │                                ┌────────────────┐    │
//!                        │                                │ negotiation    │    │
//!                        │                                │ LRU + store    │    │
//!                        │                                └───────┬────────┘    │
//!                        │                                        ▼             │
//!   Client Response      │  ┌──────────┐   ┌──────────┐   ┌────────────────┐    │
//!   ◀────────────────────┼──│ response │◀──│ rewrite  │◀──│ forward / ws   │◀───┼── Upstream
//!                        │  └──────────┘   └──────────┘   └────────────────┘    │
//!                        │                                                      │
//!                        │  config (TOML + store overrides) · observability     │
//!                        │  lifecycle (signals, shutdown) · store (kv)          │
//!                        └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use edge_gateway::config::validation::validate_config;
use edge_gateway::config::watcher::ConfigWatcher;
use edge_gateway::config::{load_config, ConfigError, GatewayConfig};
use edge_gateway::http::HttpServer;
use edge_gateway::lifecycle::signals::spawn_signal_handler;
use edge_gateway::lifecycle::Shutdown;
use edge_gateway::observability::logging::init_logging;
use edge_gateway::observability::metrics::init_metrics;
use edge_gateway::store::open_store;

#[derive(Parser)]
#[command(name = "edge-gateway")]
#[command(about = "Protocol-adaptive reverse proxy gateway", long_about = None)]
struct Cli {
    /// TOML configuration file; watched for changes
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
        validate_config(&config).map_err(ConfigError::Validation)?;
    }

    init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "edge-gateway starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => init_metrics(addr)?,
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "invalid metrics address, metrics disabled"
            ),
        }
    }

    let store = open_store(&config.store)?;
    tracing::info!(backend = ?config.store.backend, "key-value store ready");

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "listening for connections");

    let server = HttpServer::new(config, store)?;
    let runtime = server.runtime().clone();
    runtime.refresh().await;

    let shutdown = Shutdown::new();
    let _signals = spawn_signal_handler(&shutdown);
    let refresher = runtime.spawn_refresher(shutdown.subscribe());

    let (config_updates, _watcher) = match &cli.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            match watcher.run() {
                Ok(handle) => (updates, Some(handle)),
                Err(e) => {
                    tracing::warn!(error = %e, "config watcher unavailable, reloads disabled");
                    (updates, None)
                }
            }
        }
        None => {
            let (_tx, updates) = tokio::sync::mpsc::unbounded_channel();
            (updates, None)
        }
    };

    server.run(listener, config_updates, shutdown.subscribe()).await?;

    let _ = refresher.await;
    tracing::info!("shutdown complete");
    Ok(())
}
