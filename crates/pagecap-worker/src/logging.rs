//! Structured job logging utilities.
//!
//! Provides consistent, structured logging for recording jobs with
//! tracing spans and contextual information, plus the subscriber setup
//! shared by the binaries.

use tracing::{debug, error, info, warn, Span};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pagecap_models::{JobId, LifecycleState};

/// Install the global tracing subscriber.
///
/// Human readable ANSI output by default, JSON when `LOG_FORMAT=json`.
/// `RUST_LOG` directives are honored on top of `pagecap=info`.
pub fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("pagecap=info".parse().expect("static directive"))
        .add_directive("pagecap_worker=info".parse().expect("static directive"))
        .add_directive("pagecap_media=info".parse().expect("static directive"))
        .add_directive("chromiumoxide=warn".parse().expect("static directive"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

/// Job logger for structured logging with consistent formatting.
///
/// Carries the job id and operation so every lifecycle event is logged
/// with the same context.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    operation: String,
}

impl JobLogger {
    /// Create a new job logger for a specific job and operation.
    pub fn new(job_id: &JobId, operation: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Log the start of a job operation.
    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job started: {}", message
        );
    }

    /// Log a lifecycle transition.
    pub fn log_transition(&self, from: LifecycleState, to: LifecycleState) {
        debug!(
            job_id = %self.job_id,
            operation = %self.operation,
            from = from.as_str(),
            to = to.as_str(),
            "Job state changed"
        );
    }

    /// Log a progress update during job execution.
    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job progress: {}", message
        );
    }

    /// Log a warning during job execution.
    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job warning: {}", message
        );
    }

    /// Log an error during job execution.
    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job error: {}", message
        );
    }

    /// Log the completion of a job operation.
    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Create a tracing span for this job.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            operation = %self.operation
        )
    }
}
