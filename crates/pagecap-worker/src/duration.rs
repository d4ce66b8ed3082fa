//! Capture duration policy.

use crate::error::{RecorderError, RecorderResult};

/// Longest detected duration taken at face value. Some MSE players report
/// huge placeholder values before the real length is known.
pub const MAX_DETECTED_SECS: f64 = 24.0 * 60.0 * 60.0;

fn usable(secs: f64) -> bool {
    secs.is_finite() && secs > 0.0 && secs <= MAX_DETECTED_SECS
}

/// Decide how many seconds of playback to record.
///
/// A usable detected duration wins when auto detection is on (rounded up
/// to whole seconds). Otherwise the manual fallback is used. Callers add
/// the configured buffer on top.
pub fn resolve_duration(
    auto_detect: bool,
    detected: Option<f64>,
    fallback: Option<u64>,
) -> RecorderResult<u64> {
    if auto_detect {
        if let Some(secs) = detected.filter(|d| usable(*d)) {
            return Ok(secs.ceil() as u64);
        }
    }

    if let Some(secs) = fallback {
        return Ok(secs);
    }

    let reason = if !auto_detect {
        "auto detection is disabled and no manual duration was supplied".to_string()
    } else {
        match detected {
            Some(d) if d > MAX_DETECTED_SECS => format!(
                "media reported an implausible duration ({}s) and no manual duration was supplied",
                d
            ),
            Some(d) => format!(
                "media reported a non-finite duration ({}) and no manual duration was supplied, \
                 likely a live stream",
                d
            ),
            None => "media did not report a duration and no manual duration was supplied".to_string(),
        }
    };
    Err(RecorderError::duration_unresolvable(reason))
}
