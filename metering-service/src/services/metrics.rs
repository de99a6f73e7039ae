//! Metrics module for metering-service.
//! Provides Prometheus metrics for quota enforcement, settlement, and
//! processor-event reconciliation.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter, register_int_counter_vec,
    Encoder, HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "metering_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// HTTP request counter
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("metering_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"]
    )
    .expect("Failed to register HTTP_REQUESTS_TOTAL")
});

/// HTTP request duration histogram
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "metering_http_request_duration_seconds",
            "HTTP request duration",
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
        ),
        &["method", "path"]
    )
    .expect("Failed to register HTTP_REQUEST_DURATION")
});

/// Quota check counter by tier and outcome
pub static QUOTA_CHECKS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "metering_quota_checks_total",
            "Quota admission checks by tier and outcome"
        ),
        &["tier", "outcome"]
    )
    .expect("Failed to register QUOTA_CHECKS_TOTAL")
});

/// Settled usage units by source action
pub static USAGE_UNITS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "metering_usage_units_total",
            "Lead units settled by source action"
        ),
        &["source"]
    )
    .expect("Failed to register USAGE_UNITS_TOTAL")
});

/// Processor webhook events by type and outcome
pub static WEBHOOK_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "metering_webhook_events_total",
            "Processor events by type and processing outcome"
        ),
        &["event_type", "outcome"]
    )
    .expect("Failed to register WEBHOOK_EVENTS_TOTAL")
});

/// Billing periods rolled over by the sweeper
pub static PERIOD_ROLLOVERS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "metering_period_rollovers_total",
        "Billing periods rolled over by the sweeper"
    ))
    .expect("Failed to register PERIOD_ROLLOVERS_TOTAL")
});

/// Ledger counters found out of sync with the usage log
pub static COUNTER_DRIFT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "metering_counter_drift_detected_total",
        "Usage counters found out of sync with the usage event log"
    ))
    .expect("Failed to register COUNTER_DRIFT_TOTAL")
});

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    // Force initialization of lazy statics so the first scrape sees
    // every series.
    let _ = &*DB_QUERY_DURATION;
    let _ = &*HTTP_REQUESTS_TOTAL;
    let _ = &*HTTP_REQUEST_DURATION;
    let _ = &*QUOTA_CHECKS_TOTAL;
    let _ = &*USAGE_UNITS_TOTAL;
    let _ = &*WEBHOOK_EVENTS_TOTAL;
    let _ = &*PERIOD_ROLLOVERS_TOTAL;
    let _ = &*COUNTER_DRIFT_TOTAL;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Failed to convert metrics to string")
}

/// Record a quota admission check.
pub fn record_quota_check(tier: &str, allowed: bool) {
    let outcome = if allowed { "allowed" } else { "denied" };
    QUOTA_CHECKS_TOTAL.with_label_values(&[tier, outcome]).inc();
}

/// Record settled usage units.
pub fn record_usage_settled(source: &str, units: i64) {
    USAGE_UNITS_TOTAL
        .with_label_values(&[source])
        .inc_by(units.max(0) as u64);
}

/// Record a processor webhook event outcome.
pub fn record_webhook_event(event_type: &str, outcome: &str) {
    WEBHOOK_EVENTS_TOTAL
        .with_label_values(&[event_type, outcome])
        .inc();
}

/// Record billing-period rollovers.
pub fn record_rollovers(count: u64) {
    PERIOD_ROLLOVERS_TOTAL.inc_by(count);
}

/// Record detected counter drift rows.
pub fn record_counter_drift(count: u64) {
    COUNTER_DRIFT_TOTAL.inc_by(count);
}
