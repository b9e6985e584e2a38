//! Prometheus metrics for matching-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec, Counter,
    CounterVec, Encoder, Histogram, HistogramVec, TextEncoder,
};

/// Histogram for database query duration by operation.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "matching_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for auto-match runs by final status.
pub static AUTO_MATCH_RUNS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "matching_auto_match_runs_total",
        "Total number of auto-match runs",
        &["status"]
    )
    .expect("Failed to register AUTO_MATCH_RUNS")
});

/// Histogram for auto-match run duration.
pub static AUTO_MATCH_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "matching_auto_match_duration_seconds",
        "Auto-match run duration in seconds",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("Failed to register AUTO_MATCH_DURATION")
});

/// Counter for created matches by origin.
pub static MATCHES_CREATED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "matching_matches_created_total",
        "Total number of matches created",
        &["origin"]
    )
    .expect("Failed to register MATCHES_CREATED")
});

/// Counter for deleted matches.
pub static MATCHES_DELETED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "matching_matches_deleted_total",
        "Total number of matches deleted"
    )
    .expect("Failed to register MATCHES_DELETED")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "matching_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&AUTO_MATCH_RUNS);
    Lazy::force(&AUTO_MATCH_DURATION);
    Lazy::force(&MATCHES_CREATED);
    Lazy::force(&MATCHES_DELETED);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}

/// Record a finished auto-match run.
pub fn record_auto_match_run(status: &str, duration_secs: f64) {
    AUTO_MATCH_RUNS.with_label_values(&[status]).inc();
    AUTO_MATCH_DURATION.observe(duration_secs);
}

/// Record created matches.
pub fn record_matches_created(origin: &str, count: u64) {
    MATCHES_CREATED
        .with_label_values(&[origin])
        .inc_by(count as f64);
}

/// Record a deleted match.
pub fn record_match_deleted() {
    MATCHES_DELETED.inc();
}
