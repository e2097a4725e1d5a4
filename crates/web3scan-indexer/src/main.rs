use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use web3scan_indexer::abi::InterfaceRegistry;
use web3scan_indexer::config::{Config, ContractsConfig};
use web3scan_indexer::fetcher::EndpointPool;
use web3scan_indexer::handler::LogHandler;
use web3scan_indexer::store::PgStore;
use web3scan_indexer::{ScanOptions, Scanner};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "web3scan_indexer=info,sqlx=warn".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting web3scan indexer");

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    let contracts = ContractsConfig::load(&config.contracts_file)?;
    let registry = Arc::new(InterfaceRegistry::load(&contracts.contracts)?);
    tracing::info!(
        "Loaded {} contracts from {}",
        registry.len(),
        config.contracts_file.display()
    );

    if let Some(port) = config.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
            .context("Failed to start Prometheus exporter")?;
        tracing::info!("Serving metrics on port {}", port);
    }

    // Create database pool
    let pool = web3scan_common::db::create_pool(&config.database_url, config.db_max_connections).await?;

    // Run migrations
    tracing::info!("Running database migrations");
    web3scan_common::db::run_migrations(&pool).await?;

    let endpoints = EndpointPool::connect(&config.rpc_urls)?;
    tracing::info!("Using {} RPC endpoints", endpoints.len());

    let scanner = Scanner::new(
        Arc::new(PgStore::new(pool)),
        Arc::new(LogHandler),
        endpoints,
        registry,
        ScanOptions::from_config(&config, contracts.chain_id),
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Shutdown requested, draining in-flight results");
            shutdown.cancel();
        }
    });

    let report = scanner.run(cancel).await?;

    for contract in &report.contracts {
        tracing::info!(
            "{} ({:?}): started at block {}, {} jobs",
            contract.name,
            contract.contract,
            contract.start_block,
            contract.jobs
        );
    }
    for stalled in &report.reducer.stalled {
        tracing::warn!(
            "{:?}: stopped before job {}, {} results left uncommitted",
            stalled.contract,
            stalled.next_index,
            stalled.buffered
        );
    }
    if report.cancelled {
        tracing::warn!("Scan cancelled before reaching block {}", report.head);
    }

    Ok(())
}
