//! Prometheus metrics for chaos runs
//!
//! Metrics are registered lazily on first access using once_cell::Lazy and
//! can be dumped in text exposition format at the end of a run.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};

/// Load-test attempts by classification
pub static TRIAL_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "chaosrun_trial_attempts_total",
        "Total number of load-test attempts",
        &["classification"]
    )
    .expect("Failed to register trial attempts counter")
});

/// Load-test duration histogram
pub static TRIAL_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "chaosrun_trial_duration_seconds",
        "Wall-clock duration of one load-test attempt",
        &["classification"],
        // Buckets: 10s, 30s, 1m, 2m, 5m, 10m, 15m, 20m, 30m
        vec![10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 900.0, 1200.0, 1800.0]
    )
    .expect("Failed to register trial duration histogram")
});

/// Grid cells by final status (completed, failed, skipped)
pub static GRID_CELLS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "chaosrun_grid_cells_total",
        "Total number of grid cells by final status",
        &["status"]
    )
    .expect("Failed to register grid cells counter")
});

/// Health checks by check name and result
pub static HEALTH_CHECKS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "chaosrun_health_checks_total",
        "Total number of cluster health checks",
        &["check", "result"]
    )
    .expect("Failed to register health checks counter")
});

/// Chaos apply/remove/recover operations by status
pub static CHAOS_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "chaosrun_chaos_operations_total",
        "Total number of chaos lifecycle operations",
        &["operation", "status"]
    )
    .expect("Failed to register chaos operations counter")
});

/// Remote commands by host and outcome (ok, nonzero, transport)
pub static REMOTE_COMMANDS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "chaosrun_remote_commands_total",
        "Total number of remote commands issued",
        &["host", "outcome"]
    )
    .expect("Failed to register remote commands counter")
});

/// Export all metrics in Prometheus text format.
pub fn export_prometheus() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .unwrap_or_else(|e| {
            tracing::error!("Failed to encode metrics: {}", e);
        });

    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!("Failed to convert metrics to UTF-8: {}", e);
        String::from("# Error encoding metrics\n")
    })
}
