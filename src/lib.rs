//! fedi-delivery - outbound federation delivery engine
//!
//! Reliably transmits signed HTTP requests to remote inboxes despite
//! unreliable networks and hostile destinations, with bounded resources.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Producers (federation layer)               │
//! │  - build Delivery values and push them                      │
//! │  - cancel by actor, object or target                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Indexed Queue (shared)                     │
//! │  - FIFO with secondary indices                              │
//! │  - push-broadcast wait gate                                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Worker Pool                                │
//! │  - N supervised workers, private retry backlogs             │
//! │  - classification, exponential backoff, Retry-After         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Safe HTTP Client (reqwest)                 │
//! │  - connection slots, body cap, per-hop signing              │
//! │  - sanitizer on DNS results, literal IPs and redirects      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `httpclient`: SSRF-safe HTTP client, sanitizer and signers
//! - `queue`: generic indexed queue
//! - `delivery`: deliveries, workers and the worker pool
//! - `api`: operations endpoint (metrics, queue status)
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod delivery;
pub mod error;
pub mod httpclient;
pub mod metrics;
pub mod queue;

use std::sync::Arc;

/// Application state shared across the binary and the operations endpoint
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Delivery worker pool (owns the shared queue and client)
    pub pool: Arc<delivery::WorkerPool>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Build the safe HTTP client
    /// 2. Build the (stopped) worker pool around it
    ///
    /// # Errors
    /// Returns error if the client cannot be constructed
    pub fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let client = Arc::new(httpclient::Client::new(&config.http_client)?);
        let pool = Arc::new(delivery::WorkerPool::new(client, &config.delivery));

        tracing::info!("Application state initialized");

        Ok(Self {
            config: Arc::new(config),
            pool,
        })
    }
}

/// Build the operations router
///
/// Routes:
/// - `GET /health`
/// - `GET /metrics`
/// - `GET /queue`
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::queue_router())
        .merge(api::metrics_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
