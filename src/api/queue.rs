//! Queue status endpoint

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use crate::AppState;

/// Snapshot of the delivery pool
#[derive(Debug, Serialize)]
pub struct QueueStatus {
    /// Deliveries waiting in the shared queue
    pub queued: usize,
    /// Whether workers are running
    pub running: bool,
    /// Connection slots not held by a request
    pub available_slots: usize,
    /// Configured connection slots
    pub max_open_conns: usize,
}

async fn queue_status(State(state): State<AppState>) -> Json<QueueStatus> {
    let client = state.pool.client();
    Json(QueueStatus {
        queued: state.pool.queue().len(),
        running: state.pool.is_running(),
        available_slots: client.available_slots(),
        max_open_conns: client.max_open_conns(),
    })
}

/// Create queue router
///
/// Exposes the `/queue` endpoint.
pub fn queue_router() -> Router<AppState> {
    Router::new().route("/queue", get(queue_status))
}
