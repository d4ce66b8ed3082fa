//! Recording job lifecycle.
//!
//! One job walks strictly forward through its stages:
//!
//! ```text
//! Init -> DisplayReady -> AudioReady -> BrowserReady -> PageLoaded
//!      -> VideoDetected -> DurationResolved -> Capturing -> Playing
//!      -> Waiting -> Stopping -> TornDown
//! ```
//!
//! Any stage error jumps to an emergency teardown of whatever was acquired
//! so far and the job ends `Failed` with the original error. Teardown always
//! runs in the same order: capture, browser, display, audio.
//!
//! A process-wide shutdown never reaches a job's own teardown, so
//! [`JobContext::register_shutdown_cleanup`] hooks the registry flush to
//! finalize running captures and remove created audio sinks.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use pagecap_media::{
    AudioEndpoint, AudioServer, AudioSink, BrowserDriver, BrowserSession, CaptureHandle,
    CaptureRequest, CaptureTool, DisplayHandle, DisplayServer, LaunchOptions, MediaError,
    PlaybackState, ProcessRegistry,
};
use pagecap_models::{CaptureJob, JobId, JobOutcome, LifecycleState};

use crate::allocator::{ResourceAllocator, SinkAllocation};
use crate::config::JobConfig;
use crate::duration::resolve_duration;
use crate::error::{RecorderError, RecorderResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::retry::{retry_until, RetryConfig, RetryResult};

/// External programs a job drives.
#[derive(Clone)]
pub struct Collaborators {
    pub display: Arc<dyn DisplayServer>,
    /// `None` records video only
    pub audio: Option<Arc<dyn AudioServer>>,
    pub capture: Arc<dyn CaptureTool>,
    pub browser: Arc<dyn BrowserDriver>,
}

/// Notified on every lifecycle transition.
pub trait StateObserver: Send + Sync {
    fn on_transition(&self, job_id: &JobId, from: LifecycleState, to: LifecycleState);
}

/// State shared by every job of a recorder process.
pub struct JobContext {
    pub registry: Arc<ProcessRegistry>,
    pub allocator: Arc<ResourceAllocator>,
    pub collaborators: Collaborators,
    pub config: Arc<JobConfig>,
    pub observer: Option<Arc<dyn StateObserver>>,
}

impl JobContext {
    /// Run [`release_on_shutdown`](Self::release_on_shutdown) first whenever
    /// the registry is flushed.
    pub fn register_shutdown_cleanup(self: &Arc<Self>) {
        let ctx = Arc::downgrade(self);
        self.registry.register_cleanup("job-resources", move || {
            let ctx = ctx.clone();
            async move {
                if let Some(ctx) = ctx.upgrade() {
                    ctx.release_on_shutdown().await;
                }
            }
        });
    }

    /// Finalize every running capture with the capture grace period, then
    /// remove every audio sink jobs created and still hold.
    pub async fn release_on_shutdown(&self) {
        let interrupted = self
            .collaborators
            .capture
            .interrupt_all(self.config.capture_stop_grace)
            .await;
        if interrupted > 0 {
            info!(interrupted, "Interrupted running captures");
        }

        let sinks = self.allocator.take_attached_sinks();
        let Some(audio) = &self.collaborators.audio else {
            return;
        };
        for sink in sinks {
            if let Err(e) = audio.cleanup(&sink).await {
                warn!(sink = %sink.sink_name, "Audio sink cleanup failed: {}", e);
            }
        }
    }
}

/// Resources a job currently holds. Each is taken exactly once on teardown.
#[derive(Default)]
struct AcquiredResources {
    display_number: Option<u32>,
    display: Option<DisplayHandle>,
    sink: Option<SinkAllocation>,
    audio: Option<AudioSink>,
    browser: Option<Box<dyn BrowserSession>>,
    capture: Option<CaptureHandle>,
}

/// Final state of one job execution.
#[derive(Debug)]
pub struct JobRun {
    pub job: CaptureJob,
    /// Seconds of playback recorded (media duration plus buffer)
    pub recorded_secs: Option<u64>,
    pub error: Option<RecorderError>,
}

impl JobRun {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Drives one [`CaptureJob`] to a terminal state.
pub struct JobLifecycle {
    ctx: Arc<JobContext>,
    job: CaptureJob,
    parallel: bool,
    logger: JobLogger,
    resources: AcquiredResources,
    fullscreen_applied: bool,
}

impl JobLifecycle {
    /// `parallel` is set when sibling jobs may run at the same time; it
    /// selects per-job audio sinks and explicit audio routing.
    pub fn new(ctx: Arc<JobContext>, job: CaptureJob, parallel: bool) -> Self {
        let logger = JobLogger::new(&job.id, "record");
        Self {
            ctx,
            job,
            parallel,
            logger,
            resources: AcquiredResources::default(),
            fullscreen_applied: false,
        }
    }

    /// Run the job to completion. Never panics on stage failure; the error is
    /// returned in the [`JobRun`].
    pub async fn run(mut self) -> JobRun {
        let span = self.logger.create_span();
        async move {
            self.job.start();
            metrics::record_job_started();
            let started = Instant::now();
            self.logger.log_start(&format!(
                "{} -> {}",
                self.job.url,
                self.job.output_path.display()
            ));

            let result = match self.execute().await {
                Ok(recorded) => {
                    self.transition(LifecycleState::Stopping);
                    match self.release_resources().await {
                        Ok(()) => self.verify_output().await.map(|_| recorded),
                        Err(e) => Err(e),
                    }
                }
                Err(e) => {
                    self.logger
                        .log_error(&format!("{} failed: {}", self.job.state, e));
                    // The stage error stays the job's outcome
                    let _ = self.release_resources().await;
                    Err(e)
                }
            };

            let elapsed = started.elapsed().as_secs_f64();
            match result {
                Ok(recorded) => {
                    self.transition(LifecycleState::TornDown);
                    self.job.finish(JobOutcome::Succeeded {
                        output_path: self.job.output_path.clone(),
                    });
                    metrics::record_job_completed(elapsed, recorded);
                    self.logger.log_completion(&format!(
                        "recorded {}s to {}",
                        recorded,
                        self.job.output_path.display()
                    ));
                    JobRun {
                        job: self.job,
                        recorded_secs: Some(recorded),
                        error: None,
                    }
                }
                Err(e) => {
                    self.transition(LifecycleState::Failed);
                    self.job.finish(JobOutcome::Failed {
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    });
                    metrics::record_job_failed(e.kind(), elapsed);
                    JobRun {
                        job: self.job,
                        recorded_secs: None,
                        error: Some(e),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&mut self) -> RecorderResult<u64> {
        self.start_display().await?;
        self.transition(LifecycleState::DisplayReady);

        self.setup_audio().await?;
        self.transition(LifecycleState::AudioReady);

        self.launch_browser().await?;
        self.transition(LifecycleState::BrowserReady);

        self.load_page().await?;
        self.transition(LifecycleState::PageLoaded);

        self.detect_media().await?;
        self.transition(LifecycleState::VideoDetected);

        let total_secs = self.resolve_total_duration().await?;
        self.transition(LifecycleState::DurationResolved);

        self.start_capture().await?;
        self.transition(LifecycleState::Capturing);

        self.start_playback().await?;
        self.transition(LifecycleState::Playing);

        self.transition(LifecycleState::Waiting);
        self.wait_for_playback(total_secs).await?;

        Ok(total_secs)
    }

    fn transition(&mut self, to: LifecycleState) {
        let from = self.job.state;
        debug_assert!(
            from.can_transition_to(to),
            "illegal transition {} -> {}",
            from,
            to
        );
        self.job.state = to;
        self.logger.log_transition(from, to);
        if let Some(observer) = &self.ctx.observer {
            observer.on_transition(&self.job.id, from, to);
        }
    }

    /// Fail fast once a process-wide shutdown has started.
    fn ensure_running(&self) -> RecorderResult<()> {
        if self.ctx.registry.is_flushed() {
            return Err(RecorderError::process_exit_unexpected(
                "recorder is shutting down",
            ));
        }
        Ok(())
    }

    fn browser(&self) -> RecorderResult<&dyn BrowserSession> {
        self.resources
            .browser
            .as_deref()
            .ok_or_else(|| RecorderError::process_exit_unexpected("browser is not running"))
    }

    async fn start_display(&mut self) -> RecorderResult<()> {
        let ctx = Arc::clone(&self.ctx);
        let config = &ctx.config;
        let mut preferred = config.display_start;

        for attempt in 1..=config.display_start_attempts {
            self.ensure_running()?;
            let number = ctx
                .allocator
                .allocate_display(preferred, config.display_max_probe)?;
            self.resources.display_number = Some(number);
            self.job.display = Some(number);

            match ctx
                .collaborators
                .display
                .start(&self.job.id, number, self.job.capture.resolution)
                .await
            {
                Ok(handle) => {
                    self.resources.display = Some(handle);
                    return Ok(());
                }
                Err(e) if e.is_display_collision() && attempt < config.display_start_attempts => {
                    self.logger.log_warning(&format!(
                        "display :{} did not start ({}), trying the next number",
                        number, e
                    ));
                    ctx.allocator.release_display(number);
                    self.resources.display_number = None;
                    self.job.display = None;
                    metrics::record_display_retry();
                    preferred = number.saturating_add(1);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(RecorderError::resource_unavailable(
            "no display could be started",
        ))
    }

    async fn setup_audio(&mut self) -> RecorderResult<()> {
        self.ensure_running()?;
        let ctx = Arc::clone(&self.ctx);
        let Some(audio) = &ctx.collaborators.audio else {
            debug!(job_id = %self.job.id, "Audio disabled, recording video only");
            return Ok(());
        };

        let sink = ctx
            .allocator
            .allocate_sink(&ctx.config.sink_base, &self.job.id, self.parallel)?;
        self.job.sink_name = Some(sink.sink_name.clone());
        self.resources.sink = Some(sink.clone());

        let acquired = audio.setup(&sink.sink_name, !sink.claim_default).await?;
        ctx.allocator.attach_sink(acquired.clone());
        self.resources.audio = Some(acquired);
        Ok(())
    }

    async fn launch_browser(&mut self) -> RecorderResult<()> {
        self.ensure_running()?;
        let ctx = Arc::clone(&self.ctx);
        let display = self
            .resources
            .display
            .as_ref()
            .map(DisplayHandle::display_name)
            .ok_or_else(|| RecorderError::process_exit_unexpected("display is not running"))?;

        let options = LaunchOptions {
            job_id: self.job.id.clone(),
            display,
            resolution: self.job.capture.resolution,
            audio: self.resources.audio.as_ref().map(|a| AudioEndpoint {
                sink_name: a.sink_name.clone(),
                pulse_server: a.pulse_server.clone(),
            }),
            kiosk: ctx.config.kiosk,
            startup_timeout: ctx.config.browser_startup_timeout,
        };

        let session = ctx.collaborators.browser.launch(options).await?;
        self.resources.browser = Some(session);
        Ok(())
    }

    async fn load_page(&mut self) -> RecorderResult<()> {
        self.ensure_running()?;
        let ctx = Arc::clone(&self.ctx);
        let config = &ctx.config;
        let browser = self.browser()?;

        browser.new_page().await?;
        browser
            .navigate(&self.job.url, config.navigation_timeout)
            .await?;

        if config.fullscreen {
            let applied = browser.set_fullscreen(&config.media_selector).await;
            match applied {
                Ok(()) => self.fullscreen_applied = true,
                // The element often shows up later; retried once it is found
                Err(e) => debug!(job_id = %self.job.id, "Fullscreen not applied yet: {}", e),
            }
        }
        Ok(())
    }

    async fn detect_media(&mut self) -> RecorderResult<()> {
        self.ensure_running()?;
        let ctx = Arc::clone(&self.ctx);
        let config = &ctx.config;
        let browser = self.browser()?;

        for selector in &config.click_selectors {
            match browser.click_if_present(selector, config.click_timeout).await {
                Ok(true) => debug!(job_id = %self.job.id, selector = %selector, "Clicked"),
                Ok(false) => debug!(job_id = %self.job.id, selector = %selector, "Not present, skipped"),
                Err(e) => self
                    .logger
                    .log_warning(&format!("click on '{}' failed: {}", selector, e)),
            }
        }

        browser
            .find_media(&config.media_selector, config.element_timeout)
            .await?;

        if config.fullscreen && !self.fullscreen_applied {
            let applied = browser.set_fullscreen(&config.media_selector).await;
            match applied {
                Ok(()) => self.fullscreen_applied = true,
                Err(e) => self
                    .logger
                    .log_warning(&format!("fullscreen presentation failed: {}", e)),
            }
        }
        Ok(())
    }

    async fn resolve_total_duration(&mut self) -> RecorderResult<u64> {
        self.ensure_running()?;
        let ctx = Arc::clone(&self.ctx);
        let config = &ctx.config;

        let detected = if config.auto_duration {
            match self.browser()?.read_metadata(&config.media_selector).await {
                Ok(metadata) => metadata.duration,
                Err(e) => {
                    self.logger
                        .log_warning(&format!("could not read media metadata: {}", e));
                    None
                }
            }
        } else {
            None
        };

        let duration = resolve_duration(config.auto_duration, detected, config.fallback_duration)?;
        let total = duration
            .checked_add(self.job.capture.buffer_secs)
            .ok_or_else(|| {
                RecorderError::duration_unresolvable(format!(
                    "{}s plus a {}s buffer does not fit a recording length",
                    duration, self.job.capture.buffer_secs
                ))
            })?;
        self.logger.log_progress(&format!(
            "recording {}s ({}s media + {}s buffer)",
            total, duration, self.job.capture.buffer_secs
        ));
        Ok(total)
    }

    async fn start_capture(&mut self) -> RecorderResult<()> {
        self.ensure_running()?;
        let ctx = Arc::clone(&self.ctx);
        let display = self
            .resources
            .display
            .as_ref()
            .map(DisplayHandle::display_name)
            .ok_or_else(|| RecorderError::process_exit_unexpected("display is not running"))?;

        let request = CaptureRequest {
            job_id: self.job.id.clone(),
            display,
            audio_source: self.resources.audio.as_ref().map(|a| a.monitor_name.clone()),
            pulse_server: self
                .resources
                .audio
                .as_ref()
                .and_then(|a| a.pulse_server.clone()),
            output_path: self.job.output_path.clone(),
            config: self.job.capture.clone(),
            startup_timeout: ctx.config.capture_startup_timeout,
        };

        let handle = ctx.collaborators.capture.start(request).await?;
        self.resources.capture = Some(handle);

        // Let the encoder settle so the first frames of playback are kept
        tokio::time::sleep(ctx.config.settle_delay).await;
        Ok(())
    }

    async fn start_playback(&mut self) -> RecorderResult<()> {
        self.ensure_running()?;
        let ctx = Arc::clone(&self.ctx);
        let config = &ctx.config;
        let browser = self.browser()?;
        let selector = config.media_selector.as_str();

        let retry = RetryConfig::new("playback")
            .with_max_attempts(config.playback_attempts)
            .with_delay(config.playback_backoff);

        let result = retry_until(
            &retry,
            |attempt| async move {
                if config.click_before_play {
                    if let Err(e) = browser.click(selector).await {
                        debug!(attempt, "Click before play failed: {}", e);
                    }
                }
                browser.play(selector).await?;
                tokio::time::sleep(config.playback_verify_delay).await;
                browser.playback_state(selector).await
            },
            PlaybackState::is_playing,
        )
        .await;

        metrics::record_playback_attempts(result.attempts());
        match result {
            RetryResult::Success { attempts, .. } => {
                debug!(job_id = %self.job.id, attempts, "Playback started");
            }
            RetryResult::Failed { error, attempts } => {
                return Err(RecorderError::playback_failure(format!(
                    "media did not start playing after {} attempts: {}",
                    attempts, error
                )));
            }
        }

        if self.parallel {
            self.route_audio().await;
        }
        Ok(())
    }

    /// Move the browser's streams onto this job's private sink. Only
    /// possible once the browser is producing audio; best effort.
    async fn route_audio(&self) {
        let ctx = Arc::clone(&self.ctx);
        let (Some(server), Some(sink)) = (&ctx.collaborators.audio, &self.resources.audio) else {
            return;
        };
        let Some(pid) = self.resources.browser.as_ref().and_then(|b| b.pid()) else {
            return;
        };

        let retry = RetryConfig::new("route_audio")
            .with_max_attempts(ctx.config.audio_routing_attempts)
            .with_delay(Duration::from_secs(1));
        let result = retry_until(
            &retry,
            move |_| server.route_browser_audio(sink, pid),
            |moved| *moved > 0,
        )
        .await;

        match result {
            RetryResult::Success { value, .. } => {
                debug!(job_id = %self.job.id, sink = %sink.sink_name, streams = value, "Browser audio routed");
            }
            RetryResult::Failed { error, .. } => self.logger.log_warning(&format!(
                "browser audio was not routed to {}: {}",
                sink.sink_name, error
            )),
        }
    }

    async fn wait_for_playback(&mut self, total_secs: u64) -> RecorderResult<()> {
        let progress_every = self.ctx.config.progress_interval.as_secs().max(1);
        let start = Instant::now();

        for elapsed in 1..=total_secs {
            tokio::time::sleep_until(start + Duration::from_secs(elapsed)).await;
            self.ensure_running()?;

            if let Some(capture) = &self.resources.capture {
                if let Some(exit) = capture.process.as_ref().and_then(|p| p.exit_status()) {
                    return Err(RecorderError::process_exit_unexpected(format!(
                        "capture process exited while recording ({})",
                        exit
                    )));
                }
            }

            if elapsed % progress_every == 0 && elapsed < total_secs {
                let mut message = format!("{}/{}s", elapsed, total_secs);
                if let Some(progress) = self
                    .resources
                    .capture
                    .as_ref()
                    .and_then(CaptureHandle::latest_progress)
                {
                    message.push_str(&format!(
                        ", {} frames at {:.2}x",
                        progress.frame, progress.speed
                    ));
                    if progress.is_falling_behind() {
                        self.logger.log_warning("capture is falling behind realtime");
                    }
                }
                self.logger.log_progress(&message);
            }
        }
        Ok(())
    }

    /// Release everything acquired so far, in teardown order. Every step
    /// runs; failures are logged. The only error returned is a capture that
    /// had to be killed before finalizing, since its file is unusable.
    async fn release_resources(&mut self) -> RecorderResult<()> {
        let ctx = Arc::clone(&self.ctx);
        let config = &ctx.config;
        let mut outcome = Ok(());

        if let Some(capture) = self.resources.capture.take() {
            match ctx
                .collaborators
                .capture
                .stop(capture, config.capture_stop_grace)
                .await
            {
                Ok(()) => {}
                Err(MediaError::Timeout(secs)) => {
                    self.logger.log_warning(&format!(
                        "capture was killed after {}s without finalizing",
                        secs
                    ));
                    outcome = Err(RecorderError::process_exit_unexpected(format!(
                        "capture did not finalize {} within {}s",
                        self.job.output_path.display(),
                        secs
                    )));
                }
                Err(e) => self
                    .logger
                    .log_warning(&format!("capture did not stop cleanly: {}", e)),
            }
        }

        if let Some(browser) = self.resources.browser.take() {
            if let Err(e) = browser.close(config.browser_close_grace).await {
                self.logger
                    .log_warning(&format!("browser did not close cleanly: {}", e));
            }
        }

        if let Some(display) = self.resources.display.take() {
            if let Err(e) = ctx.collaborators.display.stop(display).await {
                self.logger
                    .log_warning(&format!("display did not stop cleanly: {}", e));
            }
        }
        if let Some(number) = self.resources.display_number.take() {
            ctx.allocator.release_display(number);
        }

        if let Some(sink) = self.resources.sink.take() {
            self.resources.audio = None;
            // None once a shutdown flush has removed it
            let created = ctx.allocator.detach_sink(&sink.sink_name);
            if let (Some(audio), Some(server)) = (created, &ctx.collaborators.audio) {
                if let Err(e) = server.cleanup(&audio).await {
                    self.logger
                        .log_warning(&format!("audio sink cleanup failed: {}", e));
                }
            }
            ctx.allocator.release_sink(&sink.sink_name);
        }
        outcome
    }

    /// A finished recording must have left a non-empty file behind.
    async fn verify_output(&self) -> RecorderResult<u64> {
        let path = &self.job.output_path;
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.len() > 0 => {
                debug!(job_id = %self.job.id, bytes = meta.len(), "Output verified");
                Ok(meta.len())
            }
            Ok(_) => Err(RecorderError::process_exit_unexpected(format!(
                "capture left an empty file at {}",
                path.display()
            ))),
            Err(e) => Err(RecorderError::process_exit_unexpected(format!(
                "capture output {} is missing: {}",
                path.display(),
                e
            ))),
        }
    }
}
