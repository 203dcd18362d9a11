//! Prometheus metrics for conciliacao-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Counter for sync runs by mode and final status.
pub static SYNC_RUNS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "conciliacao_sync_runs_total",
        "Total number of reconciliation runs",
        &["sync_type", "status"]
    )
    .expect("Failed to register SYNC_RUNS")
});

/// Counter for per-item outcomes within sync runs.
pub static SYNC_ITEMS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "conciliacao_sync_items_total",
        "Total number of per-item reconciliation outcomes",
        &["sync_type", "outcome"]
    )
    .expect("Failed to register SYNC_ITEMS")
});

/// Histogram for Lytex API request duration by operation.
pub static LYTEX_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "conciliacao_lytex_request_duration_seconds",
        "Lytex API request duration in seconds",
        &["operation"],
        vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("Failed to register LYTEX_REQUEST_DURATION")
});

/// Histogram for database query duration by operation.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "conciliacao_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for errors by type.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "conciliacao_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&SYNC_RUNS);
    Lazy::force(&SYNC_ITEMS);
    Lazy::force(&LYTEX_REQUEST_DURATION);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a finished sync run.
pub fn record_sync_run(sync_type: &str, status: &str) {
    SYNC_RUNS.with_label_values(&[sync_type, status]).inc();
}

/// Record a per-item outcome.
pub fn record_sync_item(sync_type: &str, outcome: &str) {
    SYNC_ITEMS.with_label_values(&[sync_type, outcome]).inc();
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
