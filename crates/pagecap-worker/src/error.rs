//! Recorder error types.

use thiserror::Error;

use pagecap_media::MediaError;

pub type RecorderResult<T> = Result<T, RecorderError>;

/// Job-level failures. Every stage error of a recording job ends up as one
/// of these.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("External tool missing: {0}")]
    ExternalToolMissing(String),

    #[error("Startup timeout: {0}")]
    StartupTimeout(String),

    #[error("Navigation failed: {0}")]
    NavigationFailure(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Duration unresolvable: {0}")]
    DurationUnresolvable(String),

    #[error("Playback failed: {0}")]
    PlaybackFailure(String),

    #[error("Process exited unexpectedly: {0}")]
    ProcessExitUnexpected(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Media error: {0}")]
    Media(MediaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecorderError {
    pub fn resource_unavailable(msg: impl Into<String>) -> Self {
        Self::ResourceUnavailable(msg.into())
    }

    pub fn duration_unresolvable(msg: impl Into<String>) -> Self {
        Self::DurationUnresolvable(msg.into())
    }

    pub fn playback_failure(msg: impl Into<String>) -> Self {
        Self::PlaybackFailure(msg.into())
    }

    pub fn process_exit_unexpected(msg: impl Into<String>) -> Self {
        Self::ProcessExitUnexpected(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Stable snake_case kind, recorded in batch results and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            RecorderError::ResourceUnavailable(_) => "resource_unavailable",
            RecorderError::ExternalToolMissing(_) => "external_tool_missing",
            RecorderError::StartupTimeout(_) => "startup_timeout",
            RecorderError::NavigationFailure(_) => "navigation_failure",
            RecorderError::ElementNotFound(_) => "element_not_found",
            RecorderError::DurationUnresolvable(_) => "duration_unresolvable",
            RecorderError::PlaybackFailure(_) => "playback_failure",
            RecorderError::ProcessExitUnexpected(_) => "process_exit_unexpected",
            RecorderError::ConfigError(_) => "config_error",
            RecorderError::Media(_) => "media_error",
            RecorderError::Io(_) => "io_error",
        }
    }
}

impl From<MediaError> for RecorderError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::ToolNotFound(tool) => Self::ExternalToolMissing(tool),
            MediaError::StartupTimeout { .. } => Self::StartupTimeout(e.to_string()),
            MediaError::ProcessExited { .. } | MediaError::Untrackable(_) => {
                Self::ProcessExitUnexpected(e.to_string())
            }
            MediaError::DisplayInUse(_) => Self::ResourceUnavailable(e.to_string()),
            MediaError::Navigation { .. } => Self::NavigationFailure(e.to_string()),
            MediaError::ElementNotFound { .. } => Self::ElementNotFound(e.to_string()),
            MediaError::Io(io) => Self::Io(io),
            other => Self::Media(other),
        }
    }
}
