//! Xvfb virtual display server.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio::process::Command;
use tracing::{debug, info, warn};

use pagecap_models::{JobId, Resolution};

use crate::command::{check_tool, forward_output};
use crate::core::{DisplayHandle, DisplayProbe, DisplayServer};
use crate::error::{MediaError, MediaResult};
use crate::poll::{poll_until, PollOutcome, DEFAULT_POLL_INTERVAL};
use crate::registry::{ProcessRegistry, TerminateOutcome};

/// Directory holding X11 unix sockets.
const X11_SOCKET_DIR: &str = "/tmp/.X11-unix";

/// Socket an X server listens on for display `number`.
pub fn socket_path(number: u32) -> PathBuf {
    PathBuf::from(format!("{}/X{}", X11_SOCKET_DIR, number))
}

/// Lock file an X server holds for display `number`.
pub fn lock_path(number: u32) -> PathBuf {
    PathBuf::from(format!("/tmp/.X{}-lock", number))
}

/// Whether some X server already claims display `number`.
pub fn display_in_use(number: u32) -> bool {
    lock_path(number).exists() || socket_path(number).exists()
}

/// Starts and stops Xvfb instances.
pub struct XvfbDisplay {
    registry: Arc<ProcessRegistry>,
    startup_timeout: Duration,
    stop_grace: Duration,
}

impl XvfbDisplay {
    pub fn new(registry: Arc<ProcessRegistry>, startup_timeout: Duration, stop_grace: Duration) -> Self {
        Self {
            registry,
            startup_timeout,
            stop_grace,
        }
    }

    fn build_args(number: u32, resolution: Resolution) -> Vec<String> {
        vec![
            format!(":{}", number),
            "-screen".to_string(),
            "0".to_string(),
            format!("{}x24", resolution),
            "-nolisten".to_string(),
            "tcp".to_string(),
            "-ac".to_string(),
            "+extension".to_string(),
            "RANDR".to_string(),
        ]
    }
}

impl DisplayProbe for XvfbDisplay {
    fn in_use(&self, number: u32) -> bool {
        display_in_use(number)
    }
}

#[async_trait]
impl DisplayServer for XvfbDisplay {
    async fn start(
        &self,
        job_id: &JobId,
        number: u32,
        resolution: Resolution,
    ) -> MediaResult<DisplayHandle> {
        let xvfb = check_tool("Xvfb")?;

        if display_in_use(number) {
            return Err(MediaError::DisplayInUse(number));
        }

        let args = Self::build_args(number, resolution);
        debug!(display = number, "Running Xvfb {}", args.join(" "));

        let mut child = Command::new(xvfb)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let name = format!("{}:xvfb", job_id);
        if let Some(stderr) = child.stderr.take() {
            forward_output(name.clone(), stderr);
        }

        let process = self
            .registry
            .track(name.clone(), child)
            .ok_or_else(|| MediaError::Untrackable(name.clone()))?;

        let socket = socket_path(number);
        let outcome = poll_until(DEFAULT_POLL_INTERVAL, self.startup_timeout, Some(&process), || {
            let ready = socket.exists();
            async move { ready.then_some(()) }
        })
        .await;

        match outcome {
            PollOutcome::Ready(()) => {
                info!(display = number, pid = process.pid(), "Virtual display ready");
                Ok(DisplayHandle {
                    number,
                    process: Some(process),
                })
            }
            PollOutcome::TimedOut => {
                self.registry
                    .terminate(&process, Signal::SIGKILL, Duration::from_secs(1))
                    .await;
                Err(MediaError::startup_timeout(
                    format!("Xvfb :{}", number),
                    self.startup_timeout.as_secs(),
                ))
            }
            PollOutcome::Exited(exit) => Err(MediaError::process_exited(name, exit)),
        }
    }

    async fn stop(&self, handle: DisplayHandle) -> MediaResult<()> {
        let Some(process) = handle.process else {
            return Ok(());
        };

        match self
            .registry
            .terminate(&process, Signal::SIGTERM, self.stop_grace)
            .await
        {
            TerminateOutcome::Killed(_) => {
                warn!(display = handle.number, "Xvfb had to be killed");
            }
            outcome => {
                debug!(display = handle.number, ?outcome, "Virtual display stopped");
            }
        }
        Ok(())
    }
}
