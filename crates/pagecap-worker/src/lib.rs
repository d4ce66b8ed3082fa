//! Page recording worker.
//!
//! This crate provides:
//! - The per-job recording lifecycle (display, audio, browser, capture)
//! - Display number and audio sink allocation shared across jobs
//! - A bounded-concurrency batch scheduler
//! - Configuration, logging, metrics and process-wide shutdown

pub mod allocator;
pub mod batch;
pub mod config;
pub mod duration;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod retry;
pub mod scheduler;
pub mod signals;

pub use allocator::{ResourceAllocator, SinkAllocation};
pub use batch::{load_url_list, parse_url_list};
pub use config::{JobConfig, RecorderConfig};
pub use duration::resolve_duration;
pub use error::{RecorderError, RecorderResult};
pub use lifecycle::{Collaborators, JobContext, JobLifecycle, JobRun, StateObserver};
pub use logging::JobLogger;
pub use retry::{retry_until, AttemptError, RetryConfig, RetryResult};
pub use scheduler::{plan_batch, BatchScheduler, PlannedJob};
pub use signals::{spawn_shutdown_handler, ShutdownCause};
