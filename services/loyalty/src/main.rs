use anyhow::{Context, Result};
use loyalty_service::api::{start_api_server, AppState};
use loyalty_service::config::Config;
use loyalty_service::ingest::TestIngestor;
use loyalty_service::object_store::S3DocumentStore;
use loyalty_service::repository::PgLedger;
use loyalty_service::stats::StatsService;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting loyalty test-result service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let ledger = Arc::new(
        PgLedger::new(&config.database)
            .await
            .context("Failed to initialize ledger")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        ledger
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let document_store = Arc::new(
        S3DocumentStore::new(&config.storage)
            .await
            .context("Failed to initialize document store")?,
    );

    let ingestor = Arc::new(TestIngestor::new(document_store, ledger.clone()));
    let stats = Arc::new(StatsService::new(ledger.clone()));

    // Create API state
    let state = AppState {
        ingestor,
        stats,
        ledger,
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Loyalty service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down loyalty service");

    api_handle.abort();

    info!("Loyalty service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
