//! Shared data models for the pagecap recorder.
//!
//! This crate provides Serde-serializable types for:
//! - Recording jobs and their lifecycle states
//! - Capture/encoding configuration
//! - Per-job batch results and summaries
//! - URL slugs for deterministic output naming

pub mod encoding;
pub mod job;
pub mod result;
pub mod state;
pub mod utils;

// Re-export common types
pub use encoding::{CaptureConfig, Resolution};
pub use job::{CaptureJob, JobId, JobOutcome};
pub use result::{BatchResult, BatchSummary};
pub use state::LifecycleState;
pub use utils::{output_file_name, url_slug, validate_page_url, UrlError};
