//! FFmpeg capture command builder and process helpers.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::debug;

use pagecap_models::{CaptureConfig, Resolution};

use crate::error::{MediaError, MediaResult};

/// One `-i` input together with the arguments that precede it.
#[derive(Debug, Clone)]
struct FfmpegInput {
    args: Vec<String>,
    source: String,
}

/// Builder for FFmpeg capture commands.
#[derive(Debug, Clone)]
pub struct CaptureCommand {
    /// Inputs in order
    inputs: Vec<FfmpegInput>,
    /// Output file path
    output: PathBuf,
    /// Output arguments (after all inputs)
    output_args: Vec<String>,
    /// Whether to overwrite output
    overwrite: bool,
    /// Log level
    log_level: String,
}

impl CaptureCommand {
    /// Create a new command writing to `output`.
    pub fn new(output: impl AsRef<Path>) -> Self {
        Self {
            inputs: Vec::new(),
            output: output.as_ref().to_path_buf(),
            output_args: Vec::new(),
            overwrite: true,
            log_level: "error".to_string(),
        }
    }

    /// Build the full capture command for a display, an optional audio
    /// monitor source and a capture configuration.
    pub fn for_capture(
        display: &str,
        audio_source: Option<&str>,
        config: &CaptureConfig,
        output: impl AsRef<Path>,
    ) -> Self {
        let mut cmd = Self::new(output).x11grab(display, config.resolution, config.framerate);
        if let Some(source) = audio_source {
            cmd = cmd.pulse(source);
        }

        cmd = cmd
            .video_codec(&config.codec)
            .preset(&config.preset)
            .crf(config.crf)
            .pixel_format("yuv420p");

        if audio_source.is_some() {
            cmd = cmd
                .audio_codec(&config.audio_codec)
                .audio_bitrate(&config.audio_bitrate);
        }

        cmd.output_args(["-movflags", "+faststart"])
    }

    /// Add an input with its preceding arguments.
    pub fn input<I, S>(mut self, args: I, source: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.push(FfmpegInput {
            args: args.into_iter().map(Into::into).collect(),
            source: source.into(),
        });
        self
    }

    /// Grab an X11 display.
    pub fn x11grab(self, display: &str, resolution: Resolution, framerate: u32) -> Self {
        self.input(
            [
                "-f".to_string(),
                "x11grab".to_string(),
                "-draw_mouse".to_string(),
                "0".to_string(),
                "-video_size".to_string(),
                resolution.to_string(),
                "-framerate".to_string(),
                framerate.to_string(),
            ],
            display,
        )
    }

    /// Record a PulseAudio source (usually a sink monitor).
    pub fn pulse(self, source: &str) -> Self {
        self.input(["-f", "pulse", "-thread_queue_size", "1024"], source)
    }

    /// Add an output argument.
    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    /// Add multiple output arguments.
    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set video codec.
    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:v").output_arg(codec)
    }

    /// Set audio codec.
    pub fn audio_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:a").output_arg(codec)
    }

    /// Set CRF (quality).
    pub fn crf(self, crf: u8) -> Self {
        self.output_arg("-crf").output_arg(crf.to_string())
    }

    /// Set preset.
    pub fn preset(self, preset: impl Into<String>) -> Self {
        self.output_arg("-preset").output_arg(preset)
    }

    /// Set audio bitrate.
    pub fn audio_bitrate(self, bitrate: impl Into<String>) -> Self {
        self.output_arg("-b:a").output_arg(bitrate)
    }

    /// Set pixel format.
    pub fn pixel_format(self, format: impl Into<String>) -> Self {
        self.output_arg("-pix_fmt").output_arg(format)
    }

    /// Set log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Build the command arguments.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if self.overwrite {
            args.push("-y".to_string());
        }

        args.push("-nostdin".to_string());
        args.push("-v".to_string());
        args.push(self.log_level.clone());

        // Progress blocks on stderr double as the readiness signal
        args.push("-progress".to_string());
        args.push("pipe:2".to_string());

        for input in &self.inputs {
            args.extend(input.args.iter().cloned());
            args.push("-i".to_string());
            args.push(input.source.clone());
        }

        args.extend(self.output_args.iter().cloned());
        args.push(self.output.to_string_lossy().to_string());

        args
    }
}

/// Locate a required external binary.
pub fn check_tool(name: &str) -> MediaResult<PathBuf> {
    which::which(name).map_err(|_| MediaError::ToolNotFound(name.to_string()))
}

/// Locate the first available binary among `candidates`.
pub fn find_any_tool(candidates: &[&str]) -> MediaResult<PathBuf> {
    candidates
        .iter()
        .find_map(|name| which::which(name).ok())
        .ok_or_else(|| MediaError::ToolNotFound(candidates.join(" / ")))
}

/// Forward every line of a child's output stream to the debug log.
pub(crate) fn forward_output<R>(process: String, stream: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.trim().is_empty() {
                debug!(process = %process, "{}", line);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(args: &[String], value: &str) -> usize {
        args.iter().position(|a| a == value).unwrap()
    }

    #[test]
    fn test_capture_command_with_audio() {
        let config = CaptureConfig::default();
        let args = CaptureCommand::for_capture(":99", Some("pagecap_job1.monitor"), &config, "/tmp/out.mp4")
            .build_args();

        // Inputs: display first, then the monitor source
        let display_input = position(&args, ":99");
        let audio_input = position(&args, "pagecap_job1.monitor");
        assert!(display_input < audio_input);
        assert_eq!(args[display_input - 1], "-i");
        assert!(args.contains(&"x11grab".to_string()));
        assert!(args.contains(&"1920x1080".to_string()));

        // Encoding options after all inputs
        assert!(position(&args, "-c:v") > audio_input);
        assert!(args.contains(&"-b:a".to_string()));
        assert!(args.contains(&config.audio_bitrate));
        assert_eq!(args.last().unwrap(), "/tmp/out.mp4");
    }

    #[test]
    fn test_capture_command_video_only() {
        let config = CaptureConfig {
            crf: 18,
            ..Default::default()
        };
        let args = CaptureCommand::for_capture(":100", None, &config, "out.mp4").build_args();

        assert!(!args.contains(&"pulse".to_string()));
        assert!(!args.contains(&"-c:a".to_string()));
        assert_eq!(args[position(&args, "-crf") + 1], "18");
        assert_eq!(args.iter().filter(|a| *a == "-i").count(), 1);
    }

    #[test]
    fn test_find_any_tool_reports_all_candidates() {
        let err = find_any_tool(&["pagecap-missing-a", "pagecap-missing-b"]).unwrap_err();
        assert!(err.to_string().contains("pagecap-missing-a / pagecap-missing-b"));
    }
}
