//! Prometheus metrics for the recorder.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::{RecorderError, RecorderResult};

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_STARTED_TOTAL: &str = "pagecap_jobs_started_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "pagecap_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "pagecap_jobs_failed_total";
    pub const JOBS_IN_FLIGHT: &str = "pagecap_jobs_in_flight";
    pub const JOB_DURATION_SECONDS: &str = "pagecap_job_duration_seconds";
    pub const RECORDED_SECONDS_TOTAL: &str = "pagecap_recorded_seconds_total";
    pub const PLAYBACK_ATTEMPTS: &str = "pagecap_playback_attempts";
    pub const DISPLAY_START_RETRIES_TOTAL: &str = "pagecap_display_start_retries_total";
}

/// Serve metrics on `addr` at `/metrics`.
pub fn init_metrics(addr: SocketAddr) -> RecorderResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| RecorderError::config_error(format!("Failed to install metrics exporter: {}", e)))
}

pub fn record_job_started() {
    counter!(names::JOBS_STARTED_TOTAL).increment(1);
    gauge!(names::JOBS_IN_FLIGHT).increment(1.0);
}

pub fn record_job_completed(duration_secs: f64, recorded_secs: u64) {
    gauge!(names::JOBS_IN_FLIGHT).decrement(1.0);
    counter!(names::JOBS_COMPLETED_TOTAL).increment(1);
    counter!(names::RECORDED_SECONDS_TOTAL).increment(recorded_secs);
    histogram!(names::JOB_DURATION_SECONDS, "status" => "succeeded").record(duration_secs);
}

pub fn record_job_failed(kind: &str, duration_secs: f64) {
    gauge!(names::JOBS_IN_FLIGHT).decrement(1.0);
    let labels = [("kind", kind.to_string())];
    counter!(names::JOBS_FAILED_TOTAL, &labels).increment(1);
    histogram!(names::JOB_DURATION_SECONDS, "status" => "failed").record(duration_secs);
}

pub fn record_playback_attempts(attempts: u32) {
    histogram!(names::PLAYBACK_ATTEMPTS).record(attempts as f64);
}

pub fn record_display_retry() {
    counter!(names::DISPLAY_START_RETRIES_TOTAL).increment(1);
}
