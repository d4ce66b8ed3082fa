//! Collaborator interfaces consumed by the recording lifecycle.
//!
//! Each external program the recorder drives (display server, audio daemon,
//! capture tool, browser) sits behind one of these traits. The system
//! implementations live in [`crate::display`], [`crate::audio`],
//! [`crate::capture`] and [`crate::browser`].

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use pagecap_models::{CaptureConfig, JobId, Resolution};

use crate::error::MediaResult;
use crate::progress::CaptureProgress;
use crate::registry::ProcessHandle;

/// `HTMLMediaElement.HAVE_FUTURE_DATA`
pub const HAVE_FUTURE_DATA: u8 = 3;

/// Out-of-band check whether a display number is taken.
pub trait DisplayProbe: Send + Sync {
    fn in_use(&self, number: u32) -> bool;
}

impl<F> DisplayProbe for F
where
    F: Fn(u32) -> bool + Send + Sync,
{
    fn in_use(&self, number: u32) -> bool {
        self(number)
    }
}

/// A running virtual display.
#[derive(Debug, Clone)]
pub struct DisplayHandle {
    pub number: u32,
    pub process: Option<ProcessHandle>,
}

impl DisplayHandle {
    /// X display name, e.g. `:99`.
    pub fn display_name(&self) -> String {
        format!(":{}", self.number)
    }
}

#[async_trait]
pub trait DisplayServer: DisplayProbe {
    /// Start a display bound to `number` and wait until it accepts clients.
    async fn start(
        &self,
        job_id: &JobId,
        number: u32,
        resolution: Resolution,
    ) -> MediaResult<DisplayHandle>;

    async fn stop(&self, handle: DisplayHandle) -> MediaResult<()>;
}

/// A virtual audio sink and the monitor source that records it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSink {
    pub sink_name: String,
    pub monitor_name: String,
    /// Server address handed to clients via `PULSE_SERVER`
    pub pulse_server: Option<String>,
    /// Module that created the sink; `None` if the sink pre-existed
    pub module_id: Option<u32>,
}

#[async_trait]
pub trait AudioServer: Send + Sync {
    /// Create (or reuse) `sink_name`. Unless `skip_default` is set the sink
    /// also becomes the default output.
    async fn setup(&self, sink_name: &str, skip_default: bool) -> MediaResult<AudioSink>;

    async fn cleanup(&self, sink: &AudioSink) -> MediaResult<()>;

    /// Move every audio stream produced by `pid` (or its descendants) onto
    /// `sink`. Returns the number of streams moved.
    async fn route_browser_audio(&self, sink: &AudioSink, pid: u32) -> MediaResult<usize>;
}

/// Everything the capture tool needs to record one job.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub job_id: JobId,
    /// X display name to grab, e.g. `:99`
    pub display: String,
    /// Monitor source to record audio from
    pub audio_source: Option<String>,
    pub pulse_server: Option<String>,
    pub output_path: PathBuf,
    pub config: CaptureConfig,
    pub startup_timeout: Duration,
}

/// A running capture.
#[derive(Debug, Clone)]
pub struct CaptureHandle {
    pub output_path: PathBuf,
    pub process: Option<ProcessHandle>,
    pub progress: Option<watch::Receiver<Option<CaptureProgress>>>,
}

impl CaptureHandle {
    /// Latest progress block reported by the encoder.
    pub fn latest_progress(&self) -> Option<CaptureProgress> {
        self.progress.as_ref().and_then(|rx| rx.borrow().clone())
    }
}

#[async_trait]
pub trait CaptureTool: Send + Sync {
    /// Start recording; resolves once the encoder reports its first frames.
    async fn start(&self, request: CaptureRequest) -> MediaResult<CaptureHandle>;

    /// Ask the encoder to finalize the file, waiting up to `grace`.
    async fn stop(&self, handle: CaptureHandle, grace: Duration) -> MediaResult<()>;

    /// Finalize every capture still running, each within `grace`. Runs on
    /// process shutdown, before the registry's generic terminate pass.
    /// Returns how many captures were interrupted.
    async fn interrupt_all(&self, grace: Duration) -> usize;
}

/// Audio endpoint a browser should play into.
#[derive(Debug, Clone)]
pub struct AudioEndpoint {
    pub sink_name: String,
    pub pulse_server: Option<String>,
}

/// Options for [`BrowserDriver::launch`].
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub job_id: JobId,
    pub display: String,
    pub resolution: Resolution,
    pub audio: Option<AudioEndpoint>,
    /// Chrome-less kiosk window
    pub kiosk: bool,
    pub startup_timeout: Duration,
}

/// Metadata of the target media element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    /// Finite duration in seconds; `None` for live streams or unknown
    pub duration: Option<f64>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub ended: bool,
    #[serde(default)]
    pub ready_state: u8,
    #[serde(default)]
    pub current_time: f64,
    #[serde(default)]
    pub video_width: u32,
    #[serde(default)]
    pub video_height: u32,
}

/// Playback state of the target media element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub paused: bool,
    pub ended: bool,
    pub ready_state: u8,
    #[serde(default)]
    pub current_time: f64,
}

impl PlaybackState {
    /// Not paused, not ended and enough data buffered to advance.
    pub fn is_playing(&self) -> bool {
        !self.paused && !self.ended && self.ready_state >= HAVE_FUTURE_DATA
    }
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self, options: LaunchOptions) -> MediaResult<Box<dyn BrowserSession>>;
}

/// A running browser with at most one page.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// OS process id of the browser, used for audio routing.
    fn pid(&self) -> Option<u32>;

    async fn new_page(&self) -> MediaResult<()>;

    async fn navigate(&self, url: &str, timeout: Duration) -> MediaResult<()>;

    /// Best effort: make `selector` fill the window without page chrome.
    async fn set_fullscreen(&self, selector: &str) -> MediaResult<()>;

    async fn find_media(&self, selector: &str, timeout: Duration) -> MediaResult<()>;

    async fn read_metadata(&self, selector: &str) -> MediaResult<MediaMetadata>;

    /// Click `selector` if it shows up within `timeout`; `Ok(false)` if not.
    async fn click_if_present(&self, selector: &str, timeout: Duration) -> MediaResult<bool>;

    async fn click(&self, selector: &str) -> MediaResult<()>;

    /// Issue a single programmatic `play()` on the media element.
    async fn play(&self, selector: &str) -> MediaResult<()>;

    async fn playback_state(&self, selector: &str) -> MediaResult<PlaybackState>;

    async fn close(&self, grace: Duration) -> MediaResult<()>;
}
