//! FFmpeg progress parsing.

use serde::{Deserialize, Serialize};

/// Progress information reported by the capture encoder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureProgress {
    /// Current frame number
    pub frame: u64,
    /// Current FPS
    pub fps: f64,
    /// Output time in milliseconds
    pub out_time_ms: i64,
    /// Output time as string (HH:MM:SS.microseconds)
    pub out_time: String,
    /// Encoding speed (1.0 = realtime)
    pub speed: f64,
    /// Frames dropped by the grabber
    pub drop_frames: u64,
    /// Whether encoding is complete
    pub is_complete: bool,
}

impl CaptureProgress {
    /// Percentage of `total_duration_ms` already recorded.
    pub fn percentage(&self, total_duration_ms: i64) -> f64 {
        if total_duration_ms <= 0 {
            return 0.0;
        }
        ((self.out_time_ms as f64 / total_duration_ms as f64) * 100.0).min(100.0)
    }

    /// Live captures should run at ~1x; a lower value means frames are lost.
    pub fn is_falling_behind(&self) -> bool {
        self.speed > 0.0 && self.speed < 0.9
    }
}

/// Parse a line of `-progress` output into `current`.
///
/// Returns a snapshot when a block ends (`progress=continue|end`).
pub fn parse_progress_line(line: &str, current: &mut CaptureProgress) -> Option<CaptureProgress> {
    let (key, value) = line.trim().split_once('=')?;
    let value = value.trim();

    match key {
        "out_time_ms" | "out_time_us" => {
            // Both keys carry microseconds in practice
            if let Ok(us) = value.parse::<i64>() {
                current.out_time_ms = us / 1000;
            }
        }
        "out_time" => current.out_time = value.to_string(),
        "frame" => {
            if let Ok(frame) = value.parse() {
                current.frame = frame;
            }
        }
        "fps" => {
            if let Ok(fps) = value.parse() {
                current.fps = fps;
            }
        }
        "drop_frames" => {
            if let Ok(dropped) = value.parse() {
                current.drop_frames = dropped;
            }
        }
        "speed" => {
            // "1.01x" or "N/A"
            if let Some(speed) = value.strip_suffix('x').and_then(|s| s.trim().parse().ok()) {
                current.speed = speed;
            }
        }
        "progress" => {
            if value == "end" {
                current.is_complete = true;
            }
            return Some(current.clone());
        }
        _ => {}
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percentage() {
        let progress = CaptureProgress {
            out_time_ms: 5000,
            ..Default::default()
        };

        assert!((progress.percentage(10000) - 50.0).abs() < 0.01);
        assert!((progress.percentage(5000) - 100.0).abs() < 0.01);
        assert_eq!(progress.percentage(0), 0.0);
    }

    #[test]
    fn test_progress_block_parsing() {
        let mut progress = CaptureProgress::default();

        assert!(parse_progress_line("frame=150", &mut progress).is_none());
        parse_progress_line("out_time_us=5000000", &mut progress);
        parse_progress_line("speed=0.5x", &mut progress);
        parse_progress_line("drop_frames=3", &mut progress);

        let block = parse_progress_line("progress=continue", &mut progress).unwrap();
        assert_eq!(block.frame, 150);
        assert_eq!(block.out_time_ms, 5000);
        assert_eq!(block.drop_frames, 3);
        assert!(block.is_falling_behind());
        assert!(!block.is_complete);

        let last = parse_progress_line("progress=end", &mut progress).unwrap();
        assert!(last.is_complete);
    }

    #[test]
    fn test_ignores_noise() {
        let mut progress = CaptureProgress::default();
        assert!(parse_progress_line("[x11grab @ 0x55] Stream #0: Video", &mut progress).is_none());
        assert!(parse_progress_line("speed=N/A", &mut progress).is_none());
        assert_eq!(progress, CaptureProgress::default());
    }
}
