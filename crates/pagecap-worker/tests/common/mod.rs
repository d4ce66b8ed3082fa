//! Mock collaborators shared by the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use pagecap_media::{
    AudioServer, AudioSink, BrowserDriver, BrowserSession, CaptureHandle, CaptureRequest,
    CaptureTool, DisplayHandle, DisplayProbe, DisplayServer, LaunchOptions, MediaError,
    MediaMetadata, MediaResult, PlaybackState, ProcessExit, ProcessRegistry,
};
use pagecap_models::{CaptureJob, CaptureConfig, JobId, LifecycleState, Resolution};
use pagecap_worker::{Collaborators, JobConfig, JobContext, ResourceAllocator, StateObserver};

/// How a mocked capture stop goes wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopFailure {
    /// The encoder exited with an error code
    BadExit,
    /// The encoder had to be killed before finalizing
    Timeout,
}

/// How the mocked programs behave.
#[derive(Debug, Clone)]
pub struct Behavior {
    /// Display numbers held by some other program
    pub busy_displays: Vec<u32>,
    /// Display starts that fail with a collision before one succeeds
    pub display_collisions: u32,
    pub fail_browser_launch: bool,
    /// Navigation fails for URLs containing this text
    pub broken_url_marker: Option<String>,
    pub media_duration: Option<f64>,
    /// `play()` calls per session that leave the media paused
    pub play_failures: u32,
    pub capture_writes_output: bool,
    pub audio_setup_fails: bool,
    pub capture_stop_failure: Option<StopFailure>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            busy_displays: Vec::new(),
            display_collisions: 0,
            fail_browser_launch: false,
            broken_url_marker: None,
            media_duration: Some(5.0),
            play_failures: 0,
            capture_writes_output: true,
            audio_setup_fails: false,
            capture_stop_failure: None,
        }
    }
}

#[derive(Default)]
pub struct Calls {
    pub display_starts: AtomicU32,
    pub display_stops: AtomicU32,
    pub audio_setups: AtomicU32,
    pub audio_cleanups: AtomicU32,
    pub audio_routes: AtomicU32,
    pub browser_launches: AtomicU32,
    pub browser_closes: AtomicU32,
    pub plays: AtomicU32,
    pub capture_starts: AtomicU32,
    pub capture_stops: AtomicU32,
    pub capture_interrupts: AtomicU32,
}

impl Calls {
    pub fn get(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }
}

/// Shared state behind every mock.
pub struct MockWorld {
    pub behavior: Behavior,
    pub calls: Calls,
    collisions_left: AtomicU32,
    /// Captures started and not yet stopped or interrupted
    captures_running: AtomicU32,
    /// Teardown calls in the order they happened
    pub teardown_log: Mutex<Vec<String>>,
    /// `(sink_name, skip_default)` per audio setup
    pub sink_setups: Mutex<Vec<(String, bool)>>,
}

impl MockWorld {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            collisions_left: AtomicU32::new(behavior.display_collisions),
            behavior,
            calls: Calls::default(),
            captures_running: AtomicU32::new(0),
            teardown_log: Mutex::new(Vec::new()),
            sink_setups: Mutex::new(Vec::new()),
        })
    }

    fn log_teardown(&self, what: &str) {
        self.teardown_log.lock().unwrap().push(what.to_string());
    }

    pub fn teardown_order(&self) -> Vec<String> {
        self.teardown_log.lock().unwrap().clone()
    }
}

pub struct MockDisplay(pub Arc<MockWorld>);

impl DisplayProbe for MockDisplay {
    fn in_use(&self, number: u32) -> bool {
        self.0.behavior.busy_displays.contains(&number)
    }
}

#[async_trait]
impl DisplayServer for MockDisplay {
    async fn start(
        &self,
        _job_id: &JobId,
        number: u32,
        _resolution: Resolution,
    ) -> MediaResult<DisplayHandle> {
        self.0.calls.display_starts.fetch_add(1, Ordering::SeqCst);
        let collide = self
            .0
            .collisions_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if collide {
            return Err(MediaError::DisplayInUse(number));
        }
        Ok(DisplayHandle {
            number,
            process: None,
        })
    }

    async fn stop(&self, _handle: DisplayHandle) -> MediaResult<()> {
        self.0.calls.display_stops.fetch_add(1, Ordering::SeqCst);
        self.0.log_teardown("display");
        Ok(())
    }
}

pub struct MockAudio(pub Arc<MockWorld>);

#[async_trait]
impl AudioServer for MockAudio {
    async fn setup(&self, sink_name: &str, skip_default: bool) -> MediaResult<AudioSink> {
        self.0.calls.audio_setups.fetch_add(1, Ordering::SeqCst);
        self.0
            .sink_setups
            .lock()
            .unwrap()
            .push((sink_name.to_string(), skip_default));
        if self.0.behavior.audio_setup_fails {
            return Err(MediaError::command_failed(
                "pactl load-module module-null-sink",
                "Connection refused",
            ));
        }
        Ok(AudioSink {
            sink_name: sink_name.to_string(),
            monitor_name: format!("{}.monitor", sink_name),
            pulse_server: None,
            module_id: Some(7),
        })
    }

    async fn cleanup(&self, _sink: &AudioSink) -> MediaResult<()> {
        self.0.calls.audio_cleanups.fetch_add(1, Ordering::SeqCst);
        self.0.log_teardown("audio");
        Ok(())
    }

    async fn route_browser_audio(&self, _sink: &AudioSink, _pid: u32) -> MediaResult<usize> {
        self.0.calls.audio_routes.fetch_add(1, Ordering::SeqCst);
        Ok(1)
    }
}

pub struct MockCapture(pub Arc<MockWorld>);

#[async_trait]
impl CaptureTool for MockCapture {
    async fn start(&self, request: CaptureRequest) -> MediaResult<CaptureHandle> {
        self.0.calls.capture_starts.fetch_add(1, Ordering::SeqCst);
        self.0.captures_running.fetch_add(1, Ordering::SeqCst);
        if self.0.behavior.capture_writes_output {
            std::fs::write(&request.output_path, b"recorded frames")?;
        }
        Ok(CaptureHandle {
            output_path: request.output_path,
            process: None,
            progress: None,
        })
    }

    async fn stop(&self, _handle: CaptureHandle, grace: Duration) -> MediaResult<()> {
        self.0.calls.capture_stops.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .0
            .captures_running
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.0.log_teardown("capture");
        match self.0.behavior.capture_stop_failure {
            None => Ok(()),
            Some(StopFailure::BadExit) => Err(MediaError::process_exited(
                "job1:ffmpeg",
                ProcessExit {
                    code: Some(1),
                    signal: None,
                },
            )),
            Some(StopFailure::Timeout) => Err(MediaError::Timeout(grace.as_secs())),
        }
    }

    async fn interrupt_all(&self, _grace: Duration) -> usize {
        let running = self.0.captures_running.swap(0, Ordering::SeqCst);
        self.0
            .calls
            .capture_interrupts
            .fetch_add(running, Ordering::SeqCst);
        running as usize
    }
}

pub struct MockBrowser(pub Arc<MockWorld>);

#[async_trait]
impl BrowserDriver for MockBrowser {
    async fn launch(&self, _options: LaunchOptions) -> MediaResult<Box<dyn BrowserSession>> {
        self.0.calls.browser_launches.fetch_add(1, Ordering::SeqCst);
        if self.0.behavior.fail_browser_launch {
            return Err(MediaError::startup_timeout("browser DevTools endpoint", 30));
        }
        Ok(Box::new(MockSession {
            world: Arc::clone(&self.0),
            plays: AtomicU32::new(0),
        }))
    }
}

pub struct MockSession {
    world: Arc<MockWorld>,
    plays: AtomicU32,
}

#[async_trait]
impl BrowserSession for MockSession {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    async fn new_page(&self) -> MediaResult<()> {
        Ok(())
    }

    async fn navigate(&self, url: &str, _timeout: Duration) -> MediaResult<()> {
        if let Some(marker) = &self.world.behavior.broken_url_marker {
            if url.contains(marker.as_str()) {
                return Err(MediaError::Navigation {
                    url: url.to_string(),
                    message: "net::ERR_NAME_NOT_RESOLVED".to_string(),
                });
            }
        }
        Ok(())
    }

    async fn set_fullscreen(&self, _selector: &str) -> MediaResult<()> {
        Ok(())
    }

    async fn find_media(&self, _selector: &str, _timeout: Duration) -> MediaResult<()> {
        Ok(())
    }

    async fn read_metadata(&self, _selector: &str) -> MediaResult<MediaMetadata> {
        Ok(MediaMetadata {
            duration: self.world.behavior.media_duration,
            paused: true,
            ready_state: 4,
            ..Default::default()
        })
    }

    async fn click_if_present(&self, _selector: &str, _timeout: Duration) -> MediaResult<bool> {
        Ok(true)
    }

    async fn click(&self, _selector: &str) -> MediaResult<()> {
        Ok(())
    }

    async fn play(&self, _selector: &str) -> MediaResult<()> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        self.world.calls.plays.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn playback_state(&self, _selector: &str) -> MediaResult<PlaybackState> {
        let plays = self.plays.load(Ordering::SeqCst);
        Ok(PlaybackState {
            paused: plays <= self.world.behavior.play_failures,
            ended: false,
            ready_state: 4,
            current_time: 0.0,
        })
    }

    async fn close(&self, _grace: Duration) -> MediaResult<()> {
        self.world.calls.browser_closes.fetch_add(1, Ordering::SeqCst);
        self.world.log_teardown("browser");
        Ok(())
    }
}

/// Records transitions and how many jobs were recording at once.
#[derive(Default)]
pub struct TransitionLog {
    events: Mutex<Vec<(String, LifecycleState, LifecycleState)>>,
    recording: AtomicUsize,
    max_recording: AtomicUsize,
}

impl TransitionLog {
    /// States entered by `job_id`, in order.
    pub fn states_for(&self, job_id: &str) -> Vec<LifecycleState> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id == job_id)
            .map(|(_, _, to)| *to)
            .collect()
    }

    /// Job ids in the order they first left `Init`.
    pub fn start_order(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, from, _)| *from == LifecycleState::Init)
            .map(|(id, _, _)| id.clone())
            .collect()
    }

    pub fn max_recording(&self) -> usize {
        self.max_recording.load(Ordering::SeqCst)
    }
}

impl StateObserver for TransitionLog {
    fn on_transition(&self, job_id: &JobId, from: LifecycleState, to: LifecycleState) {
        self.events
            .lock()
            .unwrap()
            .push((job_id.as_str().to_string(), from, to));

        if !from.is_recording() && to.is_recording() {
            let now = self.recording.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_recording.fetch_max(now, Ordering::SeqCst);
        } else if from.is_recording() && !to.is_recording() {
            self.recording.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub fn context(
    world: &Arc<MockWorld>,
    config: JobConfig,
    observer: Option<Arc<TransitionLog>>,
) -> Arc<JobContext> {
    let audio: Option<Arc<dyn AudioServer>> = if config.disable_audio {
        None
    } else {
        Some(Arc::new(MockAudio(Arc::clone(world))))
    };
    Arc::new(JobContext {
        registry: Arc::new(ProcessRegistry::new()),
        allocator: Arc::new(ResourceAllocator::new(Arc::new(MockDisplay(Arc::clone(world))))),
        collaborators: Collaborators {
            display: Arc::new(MockDisplay(Arc::clone(world))),
            audio,
            capture: Arc::new(MockCapture(Arc::clone(world))),
            browser: Arc::new(MockBrowser(Arc::clone(world))),
        },
        config: Arc::new(config),
        observer: observer.map(|o| o as Arc<dyn StateObserver>),
    })
}

pub fn job_in(dir: &Path, index: usize, url: &str) -> CaptureJob {
    CaptureJob::new(
        JobId::for_index(index),
        url,
        dir.join(format!("{}.mp4", JobId::for_index(index))),
        CaptureConfig::default(),
    )
}
