//! Capture encoding configuration.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default video codec (H.264)
pub const DEFAULT_VIDEO_CODEC: &str = "libx264";
/// Default audio codec
pub const DEFAULT_AUDIO_CODEC: &str = "aac";
/// Default encoding preset
pub const DEFAULT_PRESET: &str = "veryfast";
/// Default CRF (Constant Rate Factor)
pub const DEFAULT_CRF: u8 = 23;
/// Default audio bitrate
pub const DEFAULT_AUDIO_BITRATE: &str = "192k";
/// Default capture frame rate
pub const DEFAULT_FRAMERATE: u32 = 30;
/// Seconds of extra capture after the media duration
pub const DEFAULT_BUFFER_SECS: u64 = 5;

/// Valid libx264 presets.
pub const PRESETS: &[&str] = &[
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
];

/// Screen resolution of the virtual display and the recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(1920, 1080)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    /// Parse `WIDTHxHEIGHT`, e.g. `1280x720`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("Invalid resolution '{}', expected WIDTHxHEIGHT", s))?;
        let width = w
            .parse()
            .map_err(|_| format!("Invalid resolution width '{}'", w))?;
        let height = h
            .parse()
            .map_err(|_| format!("Invalid resolution height '{}'", h))?;
        Ok(Self { width, height })
    }
}

/// Capture configuration for one recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CaptureConfig {
    /// Display and recording size
    #[serde(default)]
    pub resolution: Resolution,

    /// Frames per second grabbed from the display
    #[serde(default = "default_framerate")]
    pub framerate: u32,

    /// Constant Rate Factor (quality, 0-51, lower is better)
    #[serde(default = "default_crf")]
    pub crf: u8,

    /// Encoding preset (e.g., "veryfast", "medium")
    #[serde(default = "default_preset")]
    pub preset: String,

    /// Video codec
    #[serde(default = "default_video_codec")]
    pub codec: String,

    /// Audio codec
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,

    /// Audio bitrate (e.g., "192k")
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,

    /// Seconds recorded past the resolved media duration
    #[serde(default = "default_buffer_secs")]
    pub buffer_secs: u64,
}

fn default_framerate() -> u32 {
    DEFAULT_FRAMERATE
}
fn default_crf() -> u8 {
    DEFAULT_CRF
}
fn default_preset() -> String {
    DEFAULT_PRESET.to_string()
}
fn default_video_codec() -> String {
    DEFAULT_VIDEO_CODEC.to_string()
}
fn default_audio_codec() -> String {
    DEFAULT_AUDIO_CODEC.to_string()
}
fn default_audio_bitrate() -> String {
    DEFAULT_AUDIO_BITRATE.to_string()
}
fn default_buffer_secs() -> u64 {
    DEFAULT_BUFFER_SECS
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::default(),
            framerate: DEFAULT_FRAMERATE,
            crf: DEFAULT_CRF,
            preset: DEFAULT_PRESET.to_string(),
            codec: DEFAULT_VIDEO_CODEC.to_string(),
            audio_codec: DEFAULT_AUDIO_CODEC.to_string(),
            audio_bitrate: DEFAULT_AUDIO_BITRATE.to_string(),
            buffer_secs: DEFAULT_BUFFER_SECS,
        }
    }
}

impl CaptureConfig {
    /// Validate the capture settings.
    pub fn validate(&self) -> Result<(), String> {
        let Resolution { width, height } = self.resolution;
        if width < 16 || height < 16 || width > 7680 || height > 4320 {
            return Err(format!("Resolution {} is out of range", self.resolution));
        }
        // yuv420p needs even dimensions
        if width % 2 != 0 || height % 2 != 0 {
            return Err(format!("Resolution {} must have even dimensions", self.resolution));
        }

        if self.framerate == 0 || self.framerate > 120 {
            return Err(format!("Framerate {} must be between 1 and 120", self.framerate));
        }

        if self.crf > 51 {
            return Err(format!("CRF {} must be between 0 and 51", self.crf));
        }

        if !PRESETS.contains(&self.preset.as_str()) {
            return Err(format!("Unknown preset '{}'", self.preset));
        }

        if !is_valid_bitrate(&self.audio_bitrate) {
            return Err(format!("Invalid audio bitrate '{}'", self.audio_bitrate));
        }

        Ok(())
    }
}

/// Bitrates look like `128k`, `1M` or a plain number of bits.
fn is_valid_bitrate(bitrate: &str) -> bool {
    let digits = bitrate.trim_end_matches(['k', 'K', 'm', 'M']);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}
