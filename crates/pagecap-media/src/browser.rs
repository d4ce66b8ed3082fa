//! Chromium driven over the DevTools protocol.
//!
//! The browser process is spawned here (so it can be tracked by the
//! [`ProcessRegistry`] and bound to a display and audio sink through its
//! environment) and then attached to with `chromiumoxide`.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use nix::sys::signal::Signal;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::find_any_tool;
use crate::core::{BrowserDriver, BrowserSession, LaunchOptions, MediaMetadata, PlaybackState};
use crate::error::{MediaError, MediaResult};
use crate::poll::{poll_until, PollOutcome};
use crate::registry::{ProcessExit, ProcessHandle, ProcessRegistry};

/// Executables tried when none is configured.
pub const BROWSER_CANDIDATES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
];

const DEVTOOLS_PREFIX: &str = "DevTools listening on ";
const ELEMENT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Extract the websocket endpoint from a Chromium stderr line.
pub fn parse_devtools_url(line: &str) -> Option<&str> {
    let (_, rest) = line.split_once(DEVTOOLS_PREFIX)?;
    let url = rest.trim();
    url.starts_with("ws://").then_some(url)
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

fn fullscreen_script(selector: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector({sel});
  if (!el) return false;
  el.style.cssText += ';position:fixed;top:0;left:0;width:100vw;height:100vh;z-index:2147483647;background:#000;object-fit:contain';
  document.documentElement.style.overflow = 'hidden';
  if (document.body) document.body.style.overflow = 'hidden';
  return true;
}})()"#,
        sel = js_string(selector)
    )
}

fn metadata_script(selector: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector({sel});
  if (!el) return {{ missing: true }};
  return {{
    duration: Number.isFinite(el.duration) ? el.duration : null,
    paused: el.paused,
    ended: el.ended,
    readyState: el.readyState,
    currentTime: el.currentTime,
    videoWidth: el.videoWidth || 0,
    videoHeight: el.videoHeight || 0
  }};
}})()"#,
        sel = js_string(selector)
    )
}

fn play_script(selector: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector({sel});
  if (!el) return {{ missing: true }};
  el.muted = false;
  const p = el.play();
  if (p && p.catch) p.catch(() => {{}});
  return {{}};
}})()"#,
        sel = js_string(selector)
    )
}

fn state_script(selector: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector({sel});
  if (!el) return {{ missing: true }};
  return {{ paused: el.paused, ended: el.ended, readyState: el.readyState, currentTime: el.currentTime }};
}})()"#,
        sel = js_string(selector)
    )
}

/// Decode a script result, mapping `{ missing: true }` to [`MediaError::ElementNotFound`].
fn element_value<T: DeserializeOwned>(value: Value, selector: &str) -> MediaResult<T> {
    if value.get("missing").is_some() {
        return Err(MediaError::ElementNotFound {
            selector: selector.to_string(),
            secs: 0,
        });
    }
    Ok(serde_json::from_value(value)?)
}

/// Launches Chromium instances.
pub struct ChromeBrowser {
    registry: Arc<ProcessRegistry>,
    executable: Option<PathBuf>,
    extra_args: Vec<String>,
}

impl ChromeBrowser {
    pub fn new(registry: Arc<ProcessRegistry>, executable: Option<PathBuf>) -> Self {
        Self {
            registry,
            executable,
            extra_args: Vec::new(),
        }
    }

    /// Extra command-line switches passed to every launch.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn resolve_executable(&self) -> MediaResult<PathBuf> {
        match &self.executable {
            Some(path) if path.components().count() > 1 => Ok(path.clone()),
            Some(name) => which::which(name)
                .map_err(|_| MediaError::ToolNotFound(name.display().to_string())),
            None => find_any_tool(BROWSER_CANDIDATES),
        }
    }

    fn build_args(&self, options: &LaunchOptions, profile: &TempDir) -> Vec<String> {
        let mut args = vec![
            "--remote-debugging-port=0".to_string(),
            format!("--user-data-dir={}", profile.path().display()),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
            "--disable-gpu".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-infobars".to_string(),
            "--autoplay-policy=no-user-gesture-required".to_string(),
            "--window-position=0,0".to_string(),
            format!(
                "--window-size={},{}",
                options.resolution.width, options.resolution.height
            ),
        ];
        if options.kiosk {
            args.push("--kiosk".to_string());
        }
        if nix::unistd::geteuid().is_root() {
            args.push("--no-sandbox".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args.push("about:blank".to_string());
        args
    }
}

fn spawn_stderr_reader(process: String, stderr: ChildStderr, url_tx: oneshot::Sender<String>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut url_tx = Some(url_tx);

        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(url) = parse_devtools_url(&line) {
                if let Some(tx) = url_tx.take() {
                    let _ = tx.send(url.to_string());
                    continue;
                }
            }
            if !line.trim().is_empty() {
                debug!(process = %process, "{}", line);
            }
        }
    });
}

#[async_trait]
impl BrowserDriver for ChromeBrowser {
    async fn launch(&self, options: LaunchOptions) -> MediaResult<Box<dyn BrowserSession>> {
        let executable = self.resolve_executable()?;
        let profile = tempfile::Builder::new()
            .prefix("pagecap-profile-")
            .tempdir()?;
        let args = self.build_args(&options, &profile);

        let mut command = Command::new(&executable);
        command
            .args(&args)
            .env("DISPLAY", &options.display)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(audio) = &options.audio {
            command.env("PULSE_SINK", &audio.sink_name);
            if let Some(server) = &audio.pulse_server {
                command.env("PULSE_SERVER", server);
            }
        }
        let mut child = command.spawn()?;

        let name = format!("{}:browser", options.job_id);
        let (url_tx, url_rx) = oneshot::channel();
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_reader(name.clone(), stderr, url_tx);
        }

        let process = self
            .registry
            .track(name.clone(), child)
            .ok_or_else(|| MediaError::Untrackable(name.clone()))?;

        let endpoint = tokio::select! {
            received = tokio::time::timeout(options.startup_timeout, url_rx) => match received {
                Ok(Ok(url)) => Ok(url),
                Ok(Err(_)) => {
                    // stderr closed without an endpoint; the process is on its way out
                    let exit = process
                        .wait_timeout(Duration::from_secs(2))
                        .await
                        .unwrap_or_else(ProcessExit::unknown);
                    Err(MediaError::process_exited(&name, exit))
                }
                Err(_) => Err(MediaError::startup_timeout(
                    "browser",
                    options.startup_timeout.as_secs(),
                )),
            },
            exit = process.wait() => Err(MediaError::process_exited(&name, exit)),
        };

        let endpoint = match endpoint {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.registry
                    .terminate(&process, Signal::SIGKILL, Duration::from_secs(1))
                    .await;
                return Err(e);
            }
        };

        let (browser, mut handler) = match Browser::connect(endpoint.clone()).await {
            Ok(connected) => connected,
            Err(e) => {
                self.registry
                    .terminate(&process, Signal::SIGKILL, Duration::from_secs(1))
                    .await;
                return Err(e.into());
            }
        };

        let handler_name = name.clone();
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(process = %handler_name, "CDP handler error: {}", e);
                }
            }
        });

        info!(
            job_id = %options.job_id,
            pid = process.pid(),
            display = %options.display,
            endpoint = %endpoint,
            "Browser launched"
        );

        Ok(Box::new(ChromeSession {
            browser: AsyncMutex::new(browser),
            page: Mutex::new(None),
            handler_task,
            process,
            registry: Arc::clone(&self.registry),
            _profile: profile,
        }))
    }
}

/// One connected Chromium instance.
pub struct ChromeSession {
    browser: AsyncMutex<Browser>,
    page: Mutex<Option<Page>>,
    handler_task: JoinHandle<()>,
    process: ProcessHandle,
    registry: Arc<ProcessRegistry>,
    _profile: TempDir,
}

impl ChromeSession {
    fn page(&self) -> MediaResult<Page> {
        self.page
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| MediaError::browser("no page open"))
    }

    async fn wait_for_element(&self, selector: &str, timeout: Duration) -> MediaResult<bool> {
        let owned = self.page()?;
        let page = &owned;
        let outcome = poll_until(ELEMENT_POLL_INTERVAL, timeout, Some(&self.process), || async move {
            page.find_element(selector).await.ok().map(|_| ())
        })
        .await;

        match outcome {
            PollOutcome::Ready(()) => Ok(true),
            PollOutcome::TimedOut => Ok(false),
            PollOutcome::Exited(exit) => Err(MediaError::process_exited(self.process.name(), exit)),
        }
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    fn pid(&self) -> Option<u32> {
        Some(self.process.pid())
    }

    async fn new_page(&self) -> MediaResult<()> {
        let page = self.browser.lock().await.new_page("about:blank").await?;
        *self.page.lock().unwrap_or_else(PoisonError::into_inner) = Some(page);
        Ok(())
    }

    async fn navigate(&self, url: &str, timeout: Duration) -> MediaResult<()> {
        let page = self.page()?;
        match tokio::time::timeout(timeout, page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(MediaError::Navigation {
                url: url.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(MediaError::Navigation {
                url: url.to_string(),
                message: format!("timed out after {} seconds", timeout.as_secs()),
            }),
        }
    }

    async fn set_fullscreen(&self, selector: &str) -> MediaResult<()> {
        let applied: bool = self
            .page()?
            .evaluate(fullscreen_script(selector))
            .await?
            .into_value()?;
        if !applied {
            return Err(MediaError::browser(format!(
                "no element matches '{}' to make fullscreen",
                selector
            )));
        }
        Ok(())
    }

    async fn find_media(&self, selector: &str, timeout: Duration) -> MediaResult<()> {
        if self.wait_for_element(selector, timeout).await? {
            Ok(())
        } else {
            Err(MediaError::ElementNotFound {
                selector: selector.to_string(),
                secs: timeout.as_secs(),
            })
        }
    }

    async fn read_metadata(&self, selector: &str) -> MediaResult<MediaMetadata> {
        let value: Value = self
            .page()?
            .evaluate(metadata_script(selector))
            .await?
            .into_value()?;
        element_value(value, selector)
    }

    async fn click_if_present(&self, selector: &str, timeout: Duration) -> MediaResult<bool> {
        if !self.wait_for_element(selector, timeout).await? {
            return Ok(false);
        }
        self.click(selector).await?;
        Ok(true)
    }

    async fn click(&self, selector: &str) -> MediaResult<()> {
        self.page()?.find_element(selector).await?.click().await?;
        Ok(())
    }

    async fn play(&self, selector: &str) -> MediaResult<()> {
        let value: Value = self
            .page()?
            .evaluate(play_script(selector))
            .await?
            .into_value()?;
        element_value::<Value>(value, selector).map(|_| ())
    }

    async fn playback_state(&self, selector: &str) -> MediaResult<PlaybackState> {
        let value: Value = self
            .page()?
            .evaluate(state_script(selector))
            .await?
            .into_value()?;
        element_value(value, selector)
    }

    async fn close(&self, grace: Duration) -> MediaResult<()> {
        self.page.lock().unwrap_or_else(PoisonError::into_inner).take();
        let mut browser = self.browser.lock().await;
        match tokio::time::timeout(grace, browser.close()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(process = %self.process.name(), "Browser.close failed: {}", e),
            Err(_) => warn!(process = %self.process.name(), "Browser.close timed out"),
        }

        let outcome = self
            .registry
            .terminate(&self.process, Signal::SIGTERM, grace)
            .await;
        debug!(process = %self.process.name(), ?outcome, "Browser closed");
        self.handler_task.abort();
        Ok(())
    }
}
