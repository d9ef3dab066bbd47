//! Prometheus metrics for the request pipeline.
//!
//! Metrics are exposed via a dedicated HTTP listener when `METRICS_PORT` is
//! non-zero.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `api_guard_requests_total` - Requests seen by the logging stage (labels: method, status)
//! - `api_guard_rejections_total` - Requests refused by a stage (labels: stage, code)
//! - `api_guard_temp_bans_total` - Temporary IP bans issued
//!
//! ## Histograms
//! - `api_guard_request_duration_seconds` - Request duration (labels: method, status)
//!
//! ## Gauges
//! - `api_guard_active_bans` - Temporary bans currently in force
//! - `api_guard_maintenance_mode` - 1 while maintenance mode is on
//!
//! # Usage
//!
//! ```rust,ignore
//! use api_guard::metrics::{init_metrics, record_rejection};
//!
//! init_metrics("0.0.0.0:9090".parse()?)?;
//! record_rejection("rate_limiting", "rate_limited");
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "api_guard_requests_total";
    pub const REJECTIONS_TOTAL: &str = "api_guard_rejections_total";
    pub const TEMP_BANS_TOTAL: &str = "api_guard_temp_bans_total";
    pub const REQUEST_DURATION_SECONDS: &str = "api_guard_request_duration_seconds";
    pub const ACTIVE_BANS: &str = "api_guard_active_bans";
    pub const MAINTENANCE_MODE: &str = "api_guard_maintenance_mode";
}

/// Initialize the Prometheus metrics exporter.
///
/// Sets up metric descriptions and starts the Prometheus HTTP listener on
/// `metrics_addr`.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::REQUESTS_TOTAL,
        "Total number of requests that passed the logging stage"
    );
    describe_counter!(
        names::REJECTIONS_TOTAL,
        "Total number of requests refused by a pipeline stage"
    );
    describe_counter!(
        names::TEMP_BANS_TOTAL,
        "Total number of temporary IP bans issued"
    );

    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );

    describe_gauge!(
        names::ACTIVE_BANS,
        "Number of temporary IP bans currently in force"
    );
    describe_gauge!(
        names::MAINTENANCE_MODE,
        "Maintenance mode (1 = on, 0 = off)"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counter Recording Functions
// =============================================================================

/// Record a request refused by a pipeline stage.
pub fn record_rejection(stage: &'static str, code: &'static str) {
    counter!(names::REJECTIONS_TOTAL, "stage" => stage, "code" => code).increment(1);
}

/// Record a temporary IP ban.
pub fn record_temp_ban() {
    counter!(names::TEMP_BANS_TOTAL).increment(1);
}

/// Record a completed request with its duration.
pub fn record_request(method: &str, status: u16, duration_secs: f64) {
    let method = method.to_string();
    let status = status.to_string();

    counter!(names::REQUESTS_TOTAL, "method" => method.clone(), "status" => status.clone())
        .increment(1);
    histogram!(names::REQUEST_DURATION_SECONDS, "method" => method, "status" => status)
        .record(duration_secs);
}

// =============================================================================
// Gauge Recording Functions
// =============================================================================

/// Update the active temporary ban gauge.
pub fn set_active_bans(count: usize) {
    gauge!(names::ACTIVE_BANS).set(count as f64);
}

/// Update the maintenance mode gauge.
pub fn set_maintenance_mode(enabled: bool) {
    gauge!(names::MAINTENANCE_MODE).set(if enabled { 1.0 } else { 0.0 });
}

#[cfg(test)]
mod tests {
    use super::*;

    // These only verify the functions don't panic without an installed recorder.

    #[test]
    fn test_record_rejection() {
        record_rejection("ip_blocking", "ip_blocked");
    }

    #[test]
    fn test_record_request() {
        record_request("GET", 200, 0.012);
    }

    #[test]
    fn test_gauges() {
        record_temp_ban();
        set_active_bans(3);
        set_maintenance_mode(true);
        set_maintenance_mode(false);
    }
}
