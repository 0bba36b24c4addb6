//! fedi-delivery binary entry point

use anyhow::{Context, Result};
use fedi_delivery::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Initialize metrics
/// 4. Initialize AppState and start the worker pool
/// 5. Serve the operations endpoint until Ctrl-C
/// 6. Stop the worker pool
#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration
    let config = config::AppConfig::load().context("Failed to load configuration")?;

    // 2. Initialize tracing/logging
    let default_filter = format!("fedi_delivery={},tower_http=info", config.logging.level);
    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| default_filter.clone().into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| default_filter.clone().into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting fedi-delivery...");

    // 3. Initialize metrics
    fedi_delivery::metrics::init_metrics();

    // 4. Initialize application state
    let state = AppState::new(config.clone()).context("Failed to initialize application state")?;
    state.pool.start(config.delivery.effective_pool_size());

    // 5. Serve the operations endpoint
    let app = fedi_delivery::build_router(state.clone());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind operations endpoint to {}", addr))?;

    tracing::info!("Operations endpoint listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Operations endpoint failed")?;

    // 6. Return every pending delivery to the queue
    state.pool.stop().await;
    tracing::info!(pending = state.pool.queue().len(), "Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
    }
}
