//! Prometheus metrics for recurring-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, CounterVec, Encoder,
    HistogramVec, IntCounter, TextEncoder,
};

/// Histogram for database query duration by operation.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "recurring_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for generated expected transactions.
pub static EXPECTED_GENERATED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "recurring_expected_generated_total",
        "Total number of expected transactions upserted by the generator"
    )
    .expect("Failed to register EXPECTED_GENERATED")
});

/// Counter for expectation matches by source (matcher, sweep, transition, settle).
pub static MATCHES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recurring_matches_total",
        "Total number of expected transactions paired with a real transaction",
        &["source"]
    )
    .expect("Failed to register MATCHES")
});

/// Counter for missed transitions by transaction type.
pub static MISSED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recurring_missed_total",
        "Total number of recurring transactions marked missed",
        &["kind"]
    )
    .expect("Failed to register MISSED")
});

/// Counter for drift correction outcomes.
pub static DRIFT_CORRECTIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recurring_drift_corrections_total",
        "Drift checks by outcome",
        &["outcome"]
    )
    .expect("Failed to register DRIFT_CORRECTIONS")
});

/// Counter for missed paycheck alerts sent.
pub static MISSED_ALERTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "recurring_missed_alerts_total",
        "Total number of missed main paycheck alerts sent"
    )
    .expect("Failed to register MISSED_ALERTS")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recurring_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&EXPECTED_GENERATED);
    Lazy::force(&MATCHES);
    Lazy::force(&MISSED);
    Lazy::force(&DRIFT_CORRECTIONS);
    Lazy::force(&MISSED_ALERTS);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}

/// Record generated expectations.
pub fn record_generated(count: usize) {
    EXPECTED_GENERATED.inc_by(count as u64);
}

/// Record a match.
pub fn record_match(source: &str) {
    MATCHES.with_label_values(&[source]).inc();
}

/// Record a missed transition.
pub fn record_missed(kind: &str) {
    MISSED.with_label_values(&[kind]).inc();
}

/// Record a drift check outcome.
pub fn record_drift(outcome: &str) {
    DRIFT_CORRECTIONS.with_label_values(&[outcome]).inc();
}

/// Record a missed paycheck alert.
pub fn record_missed_alert() {
    MISSED_ALERTS.inc();
}
