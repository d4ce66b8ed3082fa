//! Bounded retry with a fixed delay between attempts.
//!
//! Reused for playback start, audio routing and any other best-effort step
//! that may need a few tries against a flaky external process.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Wait after every failed attempt.
    pub delay: Duration,
    /// Operation name for logging.
    pub operation_name: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
            operation_name: "operation".to_string(),
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with the given operation name.
    pub fn new(operation_name: impl Into<String>) -> Self {
        Self {
            operation_name: operation_name.into(),
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Result of a retry operation.
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// Operation succeeded on attempt `attempts`.
    Success { value: T, attempts: u32 },
    /// Operation failed after all attempts were used.
    Failed { error: E, attempts: u32 },
}

impl<T, E> RetryResult<T, E> {
    /// Number of attempts made.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryResult::Success { attempts, .. } | RetryResult::Failed { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Why the last attempt of [`retry_until`] did not count.
#[derive(Debug)]
pub enum AttemptError<T, E> {
    /// The operation itself failed.
    Failed(E),
    /// The operation completed but the acceptance predicate rejected it.
    Rejected(T),
}

impl<T: fmt::Debug, E: fmt::Display> fmt::Display for AttemptError<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Failed(e) => write!(f, "{}", e),
            AttemptError::Rejected(value) => write!(f, "rejected {:?}", value),
        }
    }
}

/// Run `operation` until `accept` approves its value or the attempts run
/// out. The operation receives the 1-based attempt number.
///
/// # Example
/// ```ignore
/// let config = RetryConfig::new("route_audio").with_max_attempts(5);
/// let result = retry_until(&config, |_| audio.route(&sink, pid), |moved| *moved > 0).await;
/// ```
pub async fn retry_until<F, Fut, T, E, P>(
    config: &RetryConfig,
    mut operation: F,
    accept: P,
) -> RetryResult<T, AttemptError<T, E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&T) -> bool,
    T: fmt::Debug,
    E: fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let error = match operation(attempt).await {
            Ok(value) if accept(&value) => {
                return RetryResult::Success {
                    value,
                    attempts: attempt,
                }
            }
            Ok(value) => AttemptError::Rejected(value),
            Err(e) => AttemptError::Failed(e),
        };

        if attempt >= config.max_attempts {
            return RetryResult::Failed {
                error,
                attempts: attempt,
            };
        }

        let delay = config.delay;
        debug!(
            "{} attempt {}/{} did not succeed, retrying in {:?}: {}",
            config.operation_name, attempt, config.max_attempts, delay, error
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_waits_fixed_delay_between_attempts() {
        let config = RetryConfig::new("test")
            .with_max_attempts(3)
            .with_delay(Duration::from_secs(1));
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result = retry_until(
            &config,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("still broken") }
            },
            |_| true,
        )
        .await;

        match result {
            RetryResult::Failed {
                error: AttemptError::Failed(error),
                attempts,
            } => {
                assert_eq!(error, "still broken");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two waits between three attempts
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[test]
    fn test_at_least_one_attempt() {
        assert_eq!(RetryConfig::new("test").with_max_attempts(0).max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_accepts_third_attempt() {
        let config = RetryConfig::new("play")
            .with_max_attempts(3)
            .with_delay(Duration::from_secs(1));

        let result = retry_until(
            &config,
            |attempt| async move { Ok::<_, String>(attempt) },
            |attempt| *attempt == 3,
        )
        .await;

        assert!(matches!(result, RetryResult::Success { value: 3, .. }));
        assert_eq!(result.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_reports_last_rejection() {
        let config = RetryConfig::new("play")
            .with_max_attempts(2)
            .with_delay(Duration::from_millis(10));

        let result = retry_until(
            &config,
            |attempt| async move {
                if attempt == 1 {
                    Err("no element".to_string())
                } else {
                    Ok(false)
                }
            },
            |playing| *playing,
        )
        .await;

        match result {
            RetryResult::Failed {
                error: AttemptError::Rejected(false),
                attempts: 2,
            } => {}
            other => panic!("unexpected result {:?}", other),
        }
    }
}
