//! Recording job definitions.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::{CaptureConfig, LifecycleState};

/// Unique identifier for a job.
///
/// Ids double as suffixes for per-job audio sink names, so they are kept
/// short and restricted to `[a-z0-9-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self(uuid[..8].to_string())
    }

    /// Deterministic ID for the job at `index` (zero based) of a batch.
    pub fn for_index(index: usize) -> Self {
        Self(format!("job{}", index + 1))
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Recording finished and all resources were torn down.
    Succeeded { output_path: PathBuf },
    /// A stage failed; `kind` is the stable error kind, `message` the description.
    Failed { kind: String, message: String },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded { .. })
    }
}

/// One recording task.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CaptureJob {
    /// Unique job ID
    pub id: JobId,

    /// Page to record
    pub url: String,

    /// Where the recording is written
    pub output_path: PathBuf,

    /// Capture settings
    pub capture: CaptureConfig,

    /// Current lifecycle state
    #[serde(default)]
    pub state: LifecycleState,

    /// Display number held by this job, once allocated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<u32>,

    /// Audio sink held by this job, once allocated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sink_name: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Started at timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Finished at timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Terminal result, set when the job reaches a terminal state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<JobOutcome>,
}

impl CaptureJob {
    /// Create a new job in the `Init` state.
    pub fn new(
        id: JobId,
        url: impl Into<String>,
        output_path: impl Into<PathBuf>,
        capture: CaptureConfig,
    ) -> Self {
        Self {
            id,
            url: url.into(),
            output_path: output_path.into(),
            capture,
            state: LifecycleState::Init,
            display: None,
            sink_name: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            outcome: None,
        }
    }

    /// Mark the job as started.
    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
    }

    /// Record the terminal outcome and the matching terminal state.
    pub fn finish(&mut self, outcome: JobOutcome) {
        self.state = if outcome.is_success() {
            LifecycleState::TornDown
        } else {
            LifecycleState::Failed
        };
        self.finished_at = Some(Utc::now());
        self.outcome = Some(outcome);
    }

    /// Wall-clock seconds between start and finish, if both are known.
    pub fn elapsed_secs(&self) -> Option<f64> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        Some((finished - started).num_milliseconds() as f64 / 1000.0)
    }
}
