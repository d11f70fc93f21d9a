use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all metrics exported by this server
const PREFIX: &str = "mikrotik_backup";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_http_requests_total"), "Total number of HTTP requests"),
        &["method", "path", "status"]
    ).expect("Failed to create http_requests_total metric");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_http_request_duration_seconds"),
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        &["method", "path"]
    ).expect("Failed to create http_request_duration_seconds metric");

    // Backup runs
    pub static ref BACKUP_ATTEMPTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_backup_attempts_total"), "Backup attempts by kind and outcome"),
        &["kind", "outcome", "trigger"]
    ).expect("Failed to create backup_attempts_total metric");

    pub static ref BACKUP_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_backup_duration_seconds"),
            "Wall-clock duration of backup runs"
        )
        .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0]),
        &["kind"]
    ).expect("Failed to create backup_duration_seconds metric");

    pub static ref BACKUP_BYTES_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_backup_bytes_total"),
        "Bytes written to the artifact store"
    ).expect("Failed to create backup_bytes_total metric");

    pub static ref BACKUP_RUNS_IN_FLIGHT: Gauge = Gauge::new(
        format!("{PREFIX}_backup_runs_in_flight"),
        "Backup runs currently executing"
    ).expect("Failed to create backup_runs_in_flight metric");

    // Scheduler
    pub static ref SCHEDULER_TICKS_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_scheduler_ticks_total"),
        "Scheduler evaluation ticks"
    ).expect("Failed to create scheduler_ticks_total metric");

    pub static ref SCHEDULE_OCCURRENCES_SKIPPED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_schedule_occurrences_skipped_total"),
            "Due schedule occurrences that were not dispatched"
        ),
        &["reason"]
    ).expect("Failed to create schedule_occurrences_skipped_total metric");

    pub static ref SCHEDULE_INVALID_CADENCE_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_schedule_invalid_cadence_total"),
        "Schedules found with a malformed cadence expression"
    ).expect("Failed to create schedule_invalid_cadence_total metric");

    // Routers
    pub static ref CONNECTION_TESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_connection_tests_total"), "Explicit connection tests by result"),
        &["result"]
    ).expect("Failed to create connection_tests_total metric");

    pub static ref ROUTERS_BY_STATUS: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_routers"), "Registered routers by last known status"),
        &["status"]
    ).expect("Failed to create routers metric");
}

/// Register all metrics with the registry. Safe to call more than once.
pub fn init_metrics() {
    let _ = REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(BACKUP_ATTEMPTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(BACKUP_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(BACKUP_BYTES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(BACKUP_RUNS_IN_FLIGHT.clone()));
    let _ = REGISTRY.register(Box::new(SCHEDULER_TICKS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SCHEDULE_OCCURRENCES_SKIPPED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SCHEDULE_INVALID_CADENCE_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CONNECTION_TESTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(ROUTERS_BY_STATUS.clone()));
}

pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();

    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration.as_secs_f64());
}

/// Record the end of a backup run. `outcome` is `success` or an error kind.
pub fn record_backup_attempt(kind: &str, outcome: &str, trigger: &str, duration: Duration) {
    BACKUP_ATTEMPTS_TOTAL
        .with_label_values(&[kind, outcome, trigger])
        .inc();
    BACKUP_DURATION_SECONDS
        .with_label_values(&[kind])
        .observe(duration.as_secs_f64());
}

pub fn record_backup_bytes(bytes: u64) {
    BACKUP_BYTES_TOTAL.inc_by(bytes as f64);
}

pub fn inc_runs_in_flight() {
    BACKUP_RUNS_IN_FLIGHT.inc();
}

pub fn dec_runs_in_flight() {
    BACKUP_RUNS_IN_FLIGHT.dec();
}

pub fn record_scheduler_tick() {
    SCHEDULER_TICKS_TOTAL.inc();
}

pub fn record_skipped_occurrence(reason: &str) {
    SCHEDULE_OCCURRENCES_SKIPPED_TOTAL
        .with_label_values(&[reason])
        .inc();
}

pub fn record_invalid_cadence() {
    SCHEDULE_INVALID_CADENCE_TOTAL.inc();
}

pub fn record_connection_test(result: &str) {
    CONNECTION_TESTS_TOTAL.with_label_values(&[result]).inc();
}

pub fn set_router_counts(online: usize, offline: usize, unknown: usize) {
    ROUTERS_BY_STATUS
        .with_label_values(&["online"])
        .set(online as f64);
    ROUTERS_BY_STATUS
        .with_label_values(&["offline"])
        .set(offline as f64);
    ROUTERS_BY_STATUS
        .with_label_values(&["unknown"])
        .set(unknown as f64);
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}
