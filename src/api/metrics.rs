//! Prometheus metrics endpoint
//!
//! Exposes delivery metrics in Prometheus format for monitoring and observability.

use axum::{
    Router,
    extract::State,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::AppState;
use crate::metrics::{DELIVERY_QUEUE_LENGTH, REGISTRY};

/// Metrics endpoint handler
///
/// Refreshes the queue gauge, then returns all metrics in Prometheus text format.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    DELIVERY_QUEUE_LENGTH.set(state.pool.queue().len() as i64);

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics_text) => (
            axum::http::StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, encoder.format_type())],
            metrics_text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics",
            )
                .into_response()
        }
    }
}

/// Create metrics router
///
/// Exposes the `/metrics` endpoint.
pub fn metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics_handler))
}
