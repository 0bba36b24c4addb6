//! Operations endpoint
//!
//! HTTP handlers for:
//! - Queue status
//! - Metrics (Prometheus)

pub mod metrics;
mod queue;

pub use metrics::metrics_router;
pub use queue::queue_router;
