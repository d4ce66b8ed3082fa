//! FFmpeg screen and audio capture.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::watch;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::command::{check_tool, CaptureCommand};
use crate::core::{CaptureHandle, CaptureRequest, CaptureTool};
use crate::error::{MediaError, MediaResult};
use crate::poll::{poll_until, PollOutcome, DEFAULT_POLL_INTERVAL};
use crate::progress::{parse_progress_line, CaptureProgress};
use crate::registry::{ProcessExit, ProcessRegistry, TerminateOutcome};

/// Exit code ffmpeg reports when stopped with SIGINT after finalizing.
const INTERRUPTED_EXIT_CODE: i32 = 255;

/// Registry name suffix of every capture process.
const PROCESS_SUFFIX: &str = ":ffmpeg";

/// Records a display and a monitor source with ffmpeg.
pub struct FfmpegCapture {
    registry: Arc<ProcessRegistry>,
}

impl FfmpegCapture {
    pub fn new(registry: Arc<ProcessRegistry>) -> Self {
        Self { registry }
    }
}

/// Whether an ffmpeg exit left a finalized output file behind.
pub fn is_clean_exit(exit: &ProcessExit) -> bool {
    matches!(exit.code, Some(0) | Some(INTERRUPTED_EXIT_CODE))
}

fn spawn_progress_reader(
    process: String,
    stderr: ChildStderr,
    tx: watch::Sender<Option<CaptureProgress>>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut current = CaptureProgress::default();

        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(block) = parse_progress_line(&line, &mut current) {
                tx.send_replace(Some(block));
            } else if !line.contains('=') && !line.trim().is_empty() {
                debug!(process = %process, "{}", line);
            }
        }
    });
}

#[async_trait]
impl CaptureTool for FfmpegCapture {
    async fn start(&self, request: CaptureRequest) -> MediaResult<CaptureHandle> {
        let ffmpeg = check_tool("ffmpeg")?;

        if let Some(parent) = request.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let args = CaptureCommand::for_capture(
            &request.display,
            request.audio_source.as_deref(),
            &request.config,
            &request.output_path,
        )
        .build_args();
        debug!(job_id = %request.job_id, "Running ffmpeg {}", args.join(" "));

        let mut command = Command::new(ffmpeg);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(server) = &request.pulse_server {
            command.env("PULSE_SERVER", server);
        }
        let mut child = command.spawn()?;

        let name = format!("{}{}", request.job_id, PROCESS_SUFFIX);
        let (progress_tx, progress_rx) = watch::channel(None);
        if let Some(stderr) = child.stderr.take() {
            spawn_progress_reader(name.clone(), stderr, progress_tx);
        }

        let process = self
            .registry
            .track(name.clone(), child)
            .ok_or_else(|| MediaError::Untrackable(name.clone()))?;

        let outcome = poll_until(
            DEFAULT_POLL_INTERVAL,
            request.startup_timeout,
            Some(&process),
            || {
                let first = progress_rx.borrow().is_some();
                async move { first.then_some(()) }
            },
        )
        .await;

        match outcome {
            PollOutcome::Ready(()) => {
                info!(
                    job_id = %request.job_id,
                    pid = process.pid(),
                    output = %request.output_path.display(),
                    "Capture started"
                );
                Ok(CaptureHandle {
                    output_path: request.output_path,
                    process: Some(process),
                    progress: Some(progress_rx),
                })
            }
            PollOutcome::TimedOut => {
                self.registry
                    .terminate(&process, Signal::SIGKILL, Duration::from_secs(1))
                    .await;
                Err(MediaError::startup_timeout(
                    "ffmpeg",
                    request.startup_timeout.as_secs(),
                ))
            }
            PollOutcome::Exited(exit) => Err(MediaError::process_exited(name, exit)),
        }
    }

    async fn stop(&self, handle: CaptureHandle, grace: Duration) -> MediaResult<()> {
        let Some(process) = handle.process else {
            return Ok(());
        };

        // SIGINT lets ffmpeg write the trailer; anything harsher truncates the file
        match self.registry.terminate(&process, Signal::SIGINT, grace).await {
            TerminateOutcome::Exited(exit) | TerminateOutcome::AlreadyExited(exit) => {
                if is_clean_exit(&exit) {
                    debug!(output = %handle.output_path.display(), %exit, "Capture finalized");
                    Ok(())
                } else {
                    Err(MediaError::process_exited(process.name(), exit))
                }
            }
            TerminateOutcome::Killed(_) => {
                warn!(
                    output = %handle.output_path.display(),
                    grace_secs = grace.as_secs(),
                    "ffmpeg did not finalize in time, output may be truncated"
                );
                Err(MediaError::Timeout(grace.as_secs()))
            }
        }
    }

    async fn interrupt_all(&self, grace: Duration) -> usize {
        let running = self.registry.tracked_with_suffix(PROCESS_SUFFIX);
        let outcomes = join_all(
            running
                .iter()
                .map(|p| self.registry.terminate(p, Signal::SIGINT, grace)),
        )
        .await;

        let forced = outcomes.iter().filter(|o| o.was_forced()).count();
        if forced > 0 {
            warn!(forced, "Captures killed before finalizing on shutdown");
        }
        outcomes.len()
    }
}
