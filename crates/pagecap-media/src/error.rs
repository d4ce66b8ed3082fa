//! Error types for collaborator and process operations.

use thiserror::Error;

use crate::registry::ProcessExit;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors raised by the external collaborators and the process registry.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("{0} not found in PATH")]
    ToolNotFound(String),

    #[error("{what} did not become ready within {secs} seconds")]
    StartupTimeout { what: String, secs: u64 },

    #[error("{name} exited unexpectedly ({exit})")]
    ProcessExited { name: String, exit: ProcessExit },

    #[error("Process {0} could not be tracked")]
    Untrackable(String),

    #[error("Display :{0} is already in use")]
    DisplayInUse(u32),

    #[error("{command} failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    #[error("Element '{selector}' not found within {secs} seconds")]
    ElementNotFound { selector: String, secs: u64 },

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl MediaError {
    /// Create a command failure error.
    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a startup timeout error.
    pub fn startup_timeout(what: impl Into<String>, secs: u64) -> Self {
        Self::StartupTimeout {
            what: what.into(),
            secs,
        }
    }

    /// Create a process exit error.
    pub fn process_exited(name: impl Into<String>, exit: ProcessExit) -> Self {
        Self::ProcessExited {
            name: name.into(),
            exit,
        }
    }

    /// Create a browser error.
    pub fn browser(message: impl Into<String>) -> Self {
        Self::Browser(message.into())
    }

    /// Whether a fresh attempt on another display number could succeed.
    pub fn is_display_collision(&self) -> bool {
        matches!(
            self,
            MediaError::DisplayInUse(_)
                | MediaError::StartupTimeout { .. }
                | MediaError::ProcessExited { .. }
        )
    }
}

impl From<chromiumoxide::error::CdpError> for MediaError {
    fn from(e: chromiumoxide::error::CdpError) -> Self {
        Self::Browser(e.to_string())
    }
}
