//! Prometheus metrics for the sync engine
//!
//! Provides observability metrics for monitoring the poll scheduler and
//! escalation orchestrator in production.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};

lazy_static! {
    /// Histogram: pull cycle duration per backend (seconds)
    pub static ref PULL_DURATION: HistogramVec = register_histogram_vec!(
        "deskbridge_pull_duration_seconds",
        "Duration of pull cycles against the remote tracker",
        &["backend"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("Failed to create pull_duration metric");

    /// Counter: escalations by outcome (successful, failed, refused)
    pub static ref ESCALATIONS: CounterVec = register_counter_vec!(
        "deskbridge_escalations_total",
        "Ticket escalations by outcome",
        &["backend", "outcome"]
    )
    .expect("Failed to create escalations metric");

    /// Counter: remote API errors by type
    pub static ref API_ERRORS: CounterVec = register_counter_vec!(
        "deskbridge_api_errors_total",
        "Total remote tracker API errors by type",
        &["error_type", "backend"]
    )
    .expect("Failed to create api_errors metric");

    /// Gauge: watermark age per backend (seconds behind now)
    pub static ref WATERMARK_AGE: GaugeVec = register_gauge_vec!(
        "deskbridge_watermark_age_seconds",
        "Age of the pull watermark per backend",
        &["backend"]
    )
    .expect("Failed to create watermark_age metric");

    /// Counter: pull cycles by status
    pub static ref PULL_CYCLES: CounterVec = register_counter_vec!(
        "deskbridge_pull_cycles_total",
        "Total pull cycles by status",
        &["status"]
    )
    .expect("Failed to create pull_cycles metric");

    /// Gauge: daemon health status (1 = healthy, 0 = unhealthy)
    pub static ref HEALTH_STATUS: Gauge = register_gauge!(
        "deskbridge_health_status",
        "Daemon health status (1 = healthy, 0 = unhealthy)"
    )
    .expect("Failed to create health_status metric");
}

/// Record a pull cycle duration
pub fn record_pull_duration(backend: &str, duration_secs: f64) {
    PULL_DURATION
        .with_label_values(&[backend])
        .observe(duration_secs);
}

/// Record an escalation outcome
pub fn record_escalation(backend: &str, outcome: &str) {
    ESCALATIONS.with_label_values(&[backend, outcome]).inc();
}

/// Record a remote API error
pub fn record_api_error(error_type: &str, backend: &str) {
    API_ERRORS.with_label_values(&[error_type, backend]).inc();
}

/// Set the watermark age for a backend
pub fn set_watermark_age(backend: &str, age_secs: f64) {
    WATERMARK_AGE.with_label_values(&[backend]).set(age_secs);
}

/// Record a completed pull cycle
pub fn record_pull_cycle(status: &str) {
    PULL_CYCLES.with_label_values(&[status]).inc();
}

/// Set daemon health status
pub fn set_health_status(healthy: bool) {
    HEALTH_STATUS.set(if healthy { 1.0 } else { 0.0 });
}

/// Encode all registered metrics in Prometheus text format
pub fn gather() -> String {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
