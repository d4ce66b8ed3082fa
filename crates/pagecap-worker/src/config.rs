//! Recorder configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use pagecap_models::CaptureConfig;

use crate::error::{RecorderError, RecorderResult};

/// Default selector for the media element to record.
pub const DEFAULT_MEDIA_SELECTOR: &str = "video";

/// Default base name for virtual audio sinks.
pub const DEFAULT_SINK_BASE: &str = "pagecap_sink";

/// First display number probed.
pub const DEFAULT_DISPLAY_START: u32 = 99;

/// Per-job configuration. Every recognized option lives here with its default.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Encoding and display settings
    pub capture: CaptureConfig,
    /// Selector of the media element whose playback is recorded
    pub media_selector: String,
    /// Auxiliary elements (consent banners, play overlays) clicked before the
    /// media element is looked up; missing ones are skipped
    pub click_selectors: Vec<String>,
    /// Use the media element's own duration when it is finite
    pub auto_duration: bool,
    /// Duration used when auto detection is off or yields nothing
    pub fallback_duration: Option<u64>,
    /// Stretch the media element over the whole window
    pub fullscreen: bool,
    /// Launch the browser without window chrome
    pub kiosk: bool,
    /// First display number probed
    pub display_start: u32,
    /// How many display numbers to probe before giving up
    pub display_max_probe: u32,
    /// How many displays to try when the display server fails to come up
    pub display_start_attempts: u32,
    /// Base name for audio sinks
    pub sink_base: String,
    /// Record without an audio sink
    pub disable_audio: bool,
    /// Browser executable (name on PATH or absolute path)
    pub browser_executable: Option<PathBuf>,
    /// Extra browser switches
    pub browser_args: Vec<String>,
    pub display_startup_timeout: Duration,
    pub audio_startup_timeout: Duration,
    pub browser_startup_timeout: Duration,
    pub capture_startup_timeout: Duration,
    pub navigation_timeout: Duration,
    /// Time allowed for the media element to appear
    pub element_timeout: Duration,
    /// Time allowed for each auxiliary click target to appear
    pub click_timeout: Duration,
    /// Pause between capture start and playback
    pub settle_delay: Duration,
    /// Playback attempts before giving up
    pub playback_attempts: u32,
    /// Pause between failed playback attempts
    pub playback_backoff: Duration,
    /// Wait between `play()` and the state check
    pub playback_verify_delay: Duration,
    /// Click the media element before each `play()`
    pub click_before_play: bool,
    /// Attempts to move the browser's audio onto the job's own sink
    pub audio_routing_attempts: u32,
    /// Interval between progress logs while recording
    pub progress_interval: Duration,
    /// Time the capture tool gets to finalize its output
    pub capture_stop_grace: Duration,
    pub browser_close_grace: Duration,
    pub display_stop_grace: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            media_selector: DEFAULT_MEDIA_SELECTOR.to_string(),
            click_selectors: Vec::new(),
            auto_duration: true,
            fallback_duration: None,
            fullscreen: true,
            kiosk: true,
            display_start: DEFAULT_DISPLAY_START,
            display_max_probe: 100,
            display_start_attempts: 3,
            sink_base: DEFAULT_SINK_BASE.to_string(),
            disable_audio: false,
            browser_executable: None,
            browser_args: Vec::new(),
            display_startup_timeout: Duration::from_secs(10),
            audio_startup_timeout: Duration::from_secs(10),
            browser_startup_timeout: Duration::from_secs(30),
            capture_startup_timeout: Duration::from_secs(15),
            navigation_timeout: Duration::from_secs(60),
            element_timeout: Duration::from_secs(30),
            click_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_secs(1),
            playback_attempts: 3,
            playback_backoff: Duration::from_secs(1),
            playback_verify_delay: Duration::from_secs(2),
            click_before_play: true,
            audio_routing_attempts: 5,
            progress_interval: Duration::from_secs(10),
            capture_stop_grace: Duration::from_secs(30), // ffmpeg needs time to write the trailer
            browser_close_grace: Duration::from_secs(5),
            display_stop_grace: Duration::from_secs(5),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name).map(|v| v.trim().to_lowercase()) {
        Ok(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Ok(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

impl JobConfig {
    /// Create config from `PAGECAP_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let capture_defaults = defaults.capture.clone();

        Self {
            capture: CaptureConfig {
                resolution: env_or("PAGECAP_RESOLUTION", capture_defaults.resolution),
                framerate: env_or("PAGECAP_FRAMERATE", capture_defaults.framerate),
                crf: env_or("PAGECAP_CRF", capture_defaults.crf),
                preset: env_or("PAGECAP_PRESET", capture_defaults.preset),
                audio_bitrate: env_or("PAGECAP_AUDIO_BITRATE", capture_defaults.audio_bitrate),
                buffer_secs: env_or("PAGECAP_BUFFER_SECS", capture_defaults.buffer_secs),
                ..capture_defaults
            },
            media_selector: env_or("PAGECAP_SELECTOR", defaults.media_selector),
            click_selectors: env_list("PAGECAP_CLICK"),
            auto_duration: env_flag("PAGECAP_AUTO_DURATION", defaults.auto_duration),
            fallback_duration: std::env::var("PAGECAP_DURATION")
                .ok()
                .and_then(|s| s.trim().parse().ok()),
            fullscreen: env_flag("PAGECAP_FULLSCREEN", defaults.fullscreen),
            kiosk: env_flag("PAGECAP_KIOSK", defaults.kiosk),
            display_start: env_or("PAGECAP_DISPLAY_START", defaults.display_start),
            display_max_probe: env_or("PAGECAP_DISPLAY_MAX_PROBE", defaults.display_max_probe),
            sink_base: env_or("PAGECAP_SINK_BASE", defaults.sink_base),
            disable_audio: env_flag("PAGECAP_NO_AUDIO", defaults.disable_audio),
            browser_executable: std::env::var("PAGECAP_BROWSER").ok().map(PathBuf::from),
            browser_args: env_list("PAGECAP_BROWSER_ARGS"),
            navigation_timeout: env_secs("PAGECAP_NAVIGATION_TIMEOUT_SECS", defaults.navigation_timeout),
            element_timeout: env_secs("PAGECAP_ELEMENT_TIMEOUT_SECS", defaults.element_timeout),
            capture_stop_grace: env_secs("PAGECAP_CAPTURE_STOP_GRACE_SECS", defaults.capture_stop_grace),
            ..defaults
        }
    }

    /// Validate once before any job starts.
    pub fn validate(&self) -> RecorderResult<()> {
        self.capture.validate().map_err(RecorderError::config_error)?;

        if self.media_selector.trim().is_empty() {
            return Err(RecorderError::config_error("Media selector must not be empty"));
        }

        if !self.auto_duration && self.fallback_duration.is_none() {
            return Err(RecorderError::config_error(
                "Auto duration is disabled and no fallback duration was given",
            ));
        }

        if self.fallback_duration == Some(0) {
            return Err(RecorderError::config_error("Fallback duration must be positive"));
        }

        if self.display_max_probe == 0 || self.display_start_attempts == 0 {
            return Err(RecorderError::config_error(
                "Display probe budget and start attempts must be at least 1",
            ));
        }

        if self.playback_attempts == 0 {
            return Err(RecorderError::config_error("Playback attempts must be at least 1"));
        }

        let sink_ok = !self.sink_base.is_empty()
            && self
                .sink_base
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !sink_ok {
            return Err(RecorderError::config_error(format!(
                "Invalid sink base name '{}'",
                self.sink_base
            )));
        }

        Ok(())
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub job: JobConfig,
    /// Maximum concurrent jobs in batch mode
    pub max_concurrent_jobs: usize,
    /// Prometheus exporter listen address, if metrics should be served
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            job: JobConfig::default(),
            max_concurrent_jobs: 1,
            metrics_addr: None,
        }
    }
}

impl RecorderConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            job: JobConfig::from_env(),
            max_concurrent_jobs: env_or("PAGECAP_MAX_JOBS", 1),
            metrics_addr: std::env::var("PAGECAP_METRICS_ADDR")
                .ok()
                .and_then(|s| s.trim().parse().ok()),
        }
    }

    pub fn validate(&self) -> RecorderResult<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(RecorderError::config_error("Concurrency must be at least 1"));
        }
        self.job.validate()
    }
}
