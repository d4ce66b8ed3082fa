//! Bounded poll-with-timeout primitive.
//!
//! Used wherever a spawned process has to signal readiness through some
//! out-of-band condition (a socket file appearing, a daemon answering, the
//! first progress line from ffmpeg).

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::registry::{ProcessExit, ProcessHandle};

/// Default interval between readiness probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of [`poll_until`].
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome<T> {
    /// The probe succeeded.
    Ready(T),
    /// The deadline passed first.
    TimedOut,
    /// The watched process exited before the probe succeeded.
    Exited(ProcessExit),
}

/// Probe every `interval` until `probe` yields a value or `timeout` elapses.
///
/// When `process` is given, its exit ends the poll early with
/// [`PollOutcome::Exited`]. The probe always runs at least once.
pub async fn poll_until<T, F, Fut>(
    interval: Duration,
    timeout: Duration,
    process: Option<&ProcessHandle>,
    mut probe: F,
) -> PollOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(value) = probe().await {
            return PollOutcome::Ready(value);
        }

        if let Some(exit) = process.and_then(|p| p.exit_status()) {
            return PollOutcome::Exited(exit);
        }

        let now = Instant::now();
        if now >= deadline {
            return PollOutcome::TimedOut;
        }

        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
