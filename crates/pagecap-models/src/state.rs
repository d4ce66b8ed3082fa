//! Lifecycle states of a recording job.
//!
//! A job moves strictly forward through the success path, one stage at a
//! time. `Failed` is reachable from every non-terminal state.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a single recording job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Nothing acquired yet
    #[default]
    Init,
    /// Virtual display is running
    DisplayReady,
    /// Audio sink exists
    AudioReady,
    /// Browser is running on the display
    BrowserReady,
    /// Job URL has been loaded
    PageLoaded,
    /// Target media element located
    VideoDetected,
    /// Capture duration decided
    DurationResolved,
    /// Capture process is recording
    Capturing,
    /// Media element reports playback
    Playing,
    /// Waiting out the capture duration
    Waiting,
    /// Graceful teardown in progress
    Stopping,
    /// Success terminal
    TornDown,
    /// Failure terminal
    Failed,
}

/// Success path in order.
const SUCCESS_PATH: [LifecycleState; 12] = [
    LifecycleState::Init,
    LifecycleState::DisplayReady,
    LifecycleState::AudioReady,
    LifecycleState::BrowserReady,
    LifecycleState::PageLoaded,
    LifecycleState::VideoDetected,
    LifecycleState::DurationResolved,
    LifecycleState::Capturing,
    LifecycleState::Playing,
    LifecycleState::Waiting,
    LifecycleState::Stopping,
    LifecycleState::TornDown,
];

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Init => "init",
            LifecycleState::DisplayReady => "display_ready",
            LifecycleState::AudioReady => "audio_ready",
            LifecycleState::BrowserReady => "browser_ready",
            LifecycleState::PageLoaded => "page_loaded",
            LifecycleState::VideoDetected => "video_detected",
            LifecycleState::DurationResolved => "duration_resolved",
            LifecycleState::Capturing => "capturing",
            LifecycleState::Playing => "playing",
            LifecycleState::Waiting => "waiting",
            LifecycleState::Stopping => "stopping",
            LifecycleState::TornDown => "torn_down",
            LifecycleState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::TornDown | LifecycleState::Failed)
    }

    /// The next state on the success path, if any.
    pub fn next(&self) -> Option<LifecycleState> {
        let pos = SUCCESS_PATH.iter().position(|s| s == self)?;
        SUCCESS_PATH.get(pos + 1).copied()
    }

    /// Whether moving from `self` to `to` is a legal transition.
    pub fn can_transition_to(&self, to: LifecycleState) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == LifecycleState::Failed || self.next() == Some(to)
    }

    /// True while the capture process is recording
    /// (`Capturing`, `Playing` and `Waiting`).
    pub fn is_recording(&self) -> bool {
        matches!(
            self,
            LifecycleState::Capturing | LifecycleState::Playing | LifecycleState::Waiting
        )
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
