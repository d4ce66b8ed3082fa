#![deny(unreachable_patterns)]
//! Process plumbing and external collaborators for page recording.
//!
//! This crate provides:
//! - A registry of spawned OS processes with escalating termination
//! - A bounded poll-with-timeout primitive for readiness checks
//! - Collaborator traits for the display server, audio server, capture
//!   tool and browser, plus their system implementations
//! - FFmpeg capture command building and `-progress pipe:2` parsing

pub mod audio;
pub mod browser;
pub mod capture;
pub mod command;
pub mod core;
pub mod display;
pub mod error;
pub mod poll;
pub mod progress;
pub mod registry;

pub use audio::{monitor_name, PulseAudio};
pub use browser::{ChromeBrowser, ChromeSession, BROWSER_CANDIDATES};
pub use capture::FfmpegCapture;
pub use command::{check_tool, find_any_tool, CaptureCommand};
pub use core::{
    AudioEndpoint, AudioServer, AudioSink, BrowserDriver, BrowserSession, CaptureHandle,
    CaptureRequest, CaptureTool, DisplayHandle, DisplayProbe, DisplayServer, LaunchOptions,
    MediaMetadata, PlaybackState, HAVE_FUTURE_DATA,
};
pub use display::{display_in_use, XvfbDisplay};
pub use error::{MediaError, MediaResult};
pub use poll::{poll_until, PollOutcome, DEFAULT_POLL_INTERVAL};
pub use progress::{parse_progress_line, CaptureProgress};
pub use registry::{ProcessExit, ProcessHandle, ProcessRegistry, TerminateOutcome, FLUSH_GRACE_PERIOD};
