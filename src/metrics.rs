//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Delivery Metrics
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedi_delivery_deliveries_total", "Deliveries leaving a worker, by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERY_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedi_delivery_attempts_total", "Delivery attempts, by result class"),
        &["result"]
    ).expect("metric can be created");
    pub static ref DELIVERY_ATTEMPT_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "fedi_delivery_attempt_duration_seconds",
            "Duration of a single delivery attempt in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
    ).expect("metric can be created");
    pub static ref DELIVERY_QUEUE_LENGTH: IntGauge = IntGauge::new(
        "fedi_delivery_queue_length",
        "Deliveries waiting in the shared queue"
    ).expect("metric can be created");
    pub static ref DELIVERY_BACKLOG_SIZE: IntGauge = IntGauge::new(
        "fedi_delivery_backlog_size",
        "Deliveries waiting for backoff in worker backlogs"
    ).expect("metric can be created");
    pub static ref WORKER_RESTARTS_TOTAL: IntCounter = IntCounter::new(
        "fedi_delivery_worker_restarts_total",
        "Workers respawned after an abnormal exit"
    ).expect("metric can be created");

    // HTTP Client Metrics
    pub static ref HTTP_CLIENT_IN_FLIGHT: IntGauge = IntGauge::new(
        "fedi_delivery_http_client_in_flight",
        "Connection slots currently held by requests"
    ).expect("metric can be created");
    pub static ref SANITIZER_REJECTIONS_TOTAL: IntCounter = IntCounter::new(
        "fedi_delivery_sanitizer_rejections_total",
        "Destination addresses rejected by the sanitizer"
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(DELIVERIES_TOTAL.clone()))
        .expect("DELIVERIES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_ATTEMPTS_TOTAL.clone()))
        .expect("DELIVERY_ATTEMPTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_ATTEMPT_DURATION_SECONDS.clone()))
        .expect("DELIVERY_ATTEMPT_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_QUEUE_LENGTH.clone()))
        .expect("DELIVERY_QUEUE_LENGTH can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_BACKLOG_SIZE.clone()))
        .expect("DELIVERY_BACKLOG_SIZE can be registered");
    REGISTRY
        .register(Box::new(WORKER_RESTARTS_TOTAL.clone()))
        .expect("WORKER_RESTARTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(HTTP_CLIENT_IN_FLIGHT.clone()))
        .expect("HTTP_CLIENT_IN_FLIGHT can be registered");
    REGISTRY
        .register(Box::new(SANITIZER_REJECTIONS_TOTAL.clone()))
        .expect("SANITIZER_REJECTIONS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
