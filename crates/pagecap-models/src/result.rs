//! Per-job results and batch summaries.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{CaptureJob, JobId, JobOutcome};

/// Result of one job in a batch. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BatchResult {
    /// Position in the URL list (zero based)
    pub index: usize,
    pub job_id: JobId,
    pub url: String,
    pub success: bool,
    pub output_path: PathBuf,
    /// Stable error kind (e.g. `playback_failure`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// Human readable error description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_secs: Option<f64>,
}

impl BatchResult {
    /// Build a result from a job that reached a terminal state.
    pub fn from_job(index: usize, job: &CaptureJob) -> Self {
        let (success, error_kind, error) = match &job.outcome {
            Some(JobOutcome::Succeeded { .. }) => (true, None, None),
            Some(JobOutcome::Failed { kind, message }) => {
                (false, Some(kind.clone()), Some(message.clone()))
            }
            None => (
                false,
                Some("incomplete".to_string()),
                Some("Job ended without an outcome".to_string()),
            ),
        };

        Self {
            index,
            job_id: job.id.clone(),
            url: job.url.clone(),
            success,
            output_path: job.output_path.clone(),
            error_kind,
            error,
            finished_at: job.finished_at,
            elapsed_secs: job.elapsed_secs(),
        }
    }

    /// Result for a job whose execution never produced a job record.
    pub fn failed(
        index: usize,
        job_id: JobId,
        url: impl Into<String>,
        output_path: impl Into<PathBuf>,
        kind: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            index,
            job_id,
            url: url.into(),
            success: false,
            output_path: output_path.into(),
            error_kind: Some(kind.into()),
            error: Some(error.into()),
            finished_at: Some(Utc::now()),
            elapsed_secs: None,
        }
    }
}

/// Aggregate of all results in a batch, ordered by URL list position.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct BatchSummary {
    pub results: Vec<BatchResult>,
}

impl BatchSummary {
    pub fn new(mut results: Vec<BatchResult>) -> Self {
        results.sort_by_key(|r| r.index);
        Self { results }
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }

    /// The run fails if and only if at least one job failed.
    pub fn is_success(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &BatchResult> {
        self.results.iter().filter(|r| !r.success)
    }
}
