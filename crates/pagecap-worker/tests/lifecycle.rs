//! Job lifecycle against mock collaborators.

mod common;

use std::sync::Arc;

use pagecap_models::{JobOutcome, LifecycleState};
use pagecap_worker::{JobConfig, JobLifecycle, RecorderError};
use tokio_test::assert_ok;

use common::{context, job_in, Behavior, Calls, MockWorld, StopFailure, TransitionLog};

const URL: &str = "https://example.com/watch?v=1";

#[tokio::test(start_paused = true)]
async fn test_successful_recording_walks_every_stage() {
    let dir = tempfile::tempdir().unwrap();
    let world = MockWorld::new(Behavior::default());
    let log = Arc::new(TransitionLog::default());
    let ctx = context(&world, JobConfig::default(), Some(Arc::clone(&log)));

    let run = JobLifecycle::new(Arc::clone(&ctx), job_in(dir.path(), 0, URL), false)
        .run()
        .await;

    assert!(run.is_success(), "job failed: {:?}", run.error);
    // 5s of media plus the default 5s buffer
    assert_eq!(run.recorded_secs, Some(10));
    assert_eq!(run.job.state, LifecycleState::TornDown);
    assert!(matches!(run.job.outcome, Some(JobOutcome::Succeeded { .. })));
    assert_eq!(run.job.display, Some(99));

    assert_eq!(
        log.states_for("job1"),
        vec![
            LifecycleState::DisplayReady,
            LifecycleState::AudioReady,
            LifecycleState::BrowserReady,
            LifecycleState::PageLoaded,
            LifecycleState::VideoDetected,
            LifecycleState::DurationResolved,
            LifecycleState::Capturing,
            LifecycleState::Playing,
            LifecycleState::Waiting,
            LifecycleState::Stopping,
            LifecycleState::TornDown,
        ]
    );
    assert_eq!(
        world.teardown_order(),
        vec!["capture", "browser", "display", "audio"]
    );

    // A lone job owns the default sink
    assert_eq!(
        *world.sink_setups.lock().unwrap(),
        vec![("pagecap_sink".to_string(), false)]
    );
    assert_eq!(Calls::get(&world.calls.audio_routes), 0);
    assert!(ctx.allocator.reserved_displays().is_empty());
    assert!(ctx.allocator.reserved_sinks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_playback_succeeds_on_third_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let world = MockWorld::new(Behavior {
        play_failures: 2,
        ..Default::default()
    });
    let ctx = context(&world, JobConfig::default(), None);

    let run = JobLifecycle::new(ctx, job_in(dir.path(), 0, URL), false)
        .run()
        .await;

    assert!(run.is_success(), "job failed: {:?}", run.error);
    assert_eq!(Calls::get(&world.calls.plays), 3);
}

#[tokio::test(start_paused = true)]
async fn test_playback_failure_after_all_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let world = MockWorld::new(Behavior {
        play_failures: 3,
        ..Default::default()
    });
    let ctx = context(&world, JobConfig::default(), None);

    let run = JobLifecycle::new(Arc::clone(&ctx), job_in(dir.path(), 0, URL), false)
        .run()
        .await;

    assert!(matches!(run.error, Some(RecorderError::PlaybackFailure(_))));
    assert_eq!(Calls::get(&world.calls.plays), 3);
    assert_eq!(run.job.state, LifecycleState::Failed);
    match &run.job.outcome {
        Some(JobOutcome::Failed { kind, .. }) => assert_eq!(kind, "playback_failure"),
        other => panic!("unexpected outcome {:?}", other),
    }

    // Capture had started, so everything is torn down
    assert_eq!(
        world.teardown_order(),
        vec!["capture", "browser", "display", "audio"]
    );
    assert!(ctx.allocator.reserved_displays().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_emergency_teardown_releases_only_acquired_resources() {
    let dir = tempfile::tempdir().unwrap();
    let world = MockWorld::new(Behavior {
        fail_browser_launch: true,
        ..Default::default()
    });
    let ctx = context(&world, JobConfig::default(), None);

    let run = JobLifecycle::new(Arc::clone(&ctx), job_in(dir.path(), 0, URL), false)
        .run()
        .await;

    assert!(matches!(run.error, Some(RecorderError::StartupTimeout(_))));
    assert_eq!(Calls::get(&world.calls.display_stops), 1);
    assert_eq!(Calls::get(&world.calls.audio_cleanups), 1);
    assert_eq!(Calls::get(&world.calls.capture_starts), 0);
    assert_eq!(Calls::get(&world.calls.capture_stops), 0);
    assert_eq!(Calls::get(&world.calls.browser_closes), 0);
    assert_eq!(world.teardown_order(), vec!["display", "audio"]);

    assert!(ctx.allocator.reserved_displays().is_empty());
    assert!(ctx.allocator.reserved_sinks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_live_stream_without_fallback_fails_before_capture() {
    let dir = tempfile::tempdir().unwrap();
    let world = MockWorld::new(Behavior {
        media_duration: None,
        ..Default::default()
    });
    let ctx = context(&world, JobConfig::default(), None);

    let run = JobLifecycle::new(ctx, job_in(dir.path(), 0, URL), false)
        .run()
        .await;

    assert_eq!(run.error.as_ref().map(RecorderError::kind), Some("duration_unresolvable"));
    assert_eq!(Calls::get(&world.calls.capture_starts), 0);
    assert_eq!(Calls::get(&world.calls.browser_closes), 1);
}

#[tokio::test(start_paused = true)]
async fn test_live_stream_with_fallback_records_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let world = MockWorld::new(Behavior {
        media_duration: None,
        ..Default::default()
    });
    let config = JobConfig {
        fallback_duration: Some(30),
        ..Default::default()
    };
    let ctx = context(&world, config, None);

    let run = JobLifecycle::new(ctx, job_in(dir.path(), 0, URL), false)
        .run()
        .await;

    assert_eq!(run.recorded_secs, Some(35));
}

#[tokio::test(start_paused = true)]
async fn test_placeholder_duration_fails_before_capture() {
    let dir = tempfile::tempdir().unwrap();
    let world = MockWorld::new(Behavior {
        media_duration: Some(1e300),
        ..Default::default()
    });
    let ctx = context(&world, JobConfig::default(), None);

    let run = JobLifecycle::new(Arc::clone(&ctx), job_in(dir.path(), 0, URL), false)
        .run()
        .await;

    assert_eq!(run.error.as_ref().map(RecorderError::kind), Some("duration_unresolvable"));
    assert_eq!(Calls::get(&world.calls.capture_starts), 0);
    assert_eq!(world.teardown_order(), vec!["browser", "display", "audio"]);
    assert!(ctx.allocator.reserved_displays().is_empty());
    assert!(ctx.allocator.reserved_sinks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_placeholder_duration_uses_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let world = MockWorld::new(Behavior {
        media_duration: Some(1e300),
        ..Default::default()
    });
    let config = JobConfig {
        fallback_duration: Some(20),
        ..Default::default()
    };
    let ctx = context(&world, config, None);

    let run = JobLifecycle::new(ctx, job_in(dir.path(), 0, URL), false)
        .run()
        .await;

    assert_eq!(run.recorded_secs, Some(25));
}

#[tokio::test(start_paused = true)]
async fn test_buffer_overflowing_duration_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let world = MockWorld::new(Behavior {
        media_duration: None,
        ..Default::default()
    });
    let config = JobConfig {
        fallback_duration: Some(u64::MAX),
        ..Default::default()
    };
    let ctx = context(&world, config, None);

    let run = JobLifecycle::new(ctx, job_in(dir.path(), 0, URL), false)
        .run()
        .await;

    assert_eq!(run.error.as_ref().map(RecorderError::kind), Some("duration_unresolvable"));
    assert_eq!(Calls::get(&world.calls.capture_starts), 0);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_error_keeps_original_failure() {
    let dir = tempfile::tempdir().unwrap();
    let world = MockWorld::new(Behavior {
        play_failures: 3,
        capture_stop_failure: Some(StopFailure::BadExit),
        ..Default::default()
    });
    let ctx = context(&world, JobConfig::default(), None);

    let run = JobLifecycle::new(Arc::clone(&ctx), job_in(dir.path(), 0, URL), false)
        .run()
        .await;

    assert_eq!(run.error.as_ref().map(RecorderError::kind), Some("playback_failure"));
    // Later steps still ran after the capture stop failed
    assert_eq!(
        world.teardown_order(),
        vec!["capture", "browser", "display", "audio"]
    );
    assert_eq!(Calls::get(&world.calls.display_stops), 1);
    assert!(ctx.allocator.reserved_displays().is_empty());
    assert!(ctx.allocator.reserved_sinks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_audio_setup_failure_releases_display() {
    let dir = tempfile::tempdir().unwrap();
    let world = MockWorld::new(Behavior {
        audio_setup_fails: true,
        ..Default::default()
    });
    let log = Arc::new(TransitionLog::default());
    let ctx = context(&world, JobConfig::default(), Some(Arc::clone(&log)));

    let run = JobLifecycle::new(Arc::clone(&ctx), job_in(dir.path(), 0, URL), false)
        .run()
        .await;

    assert_eq!(run.error.as_ref().map(RecorderError::kind), Some("media_error"));
    assert_eq!(
        log.states_for("job1"),
        vec![LifecycleState::DisplayReady, LifecycleState::Failed]
    );
    assert_eq!(Calls::get(&world.calls.display_stops), 1);
    assert_eq!(Calls::get(&world.calls.audio_cleanups), 0);
    assert_eq!(Calls::get(&world.calls.browser_launches), 0);
    assert_eq!(world.teardown_order(), vec!["display"]);
    assert!(ctx.allocator.reserved_displays().is_empty());
    assert!(ctx.allocator.reserved_sinks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unfinalized_capture_fails_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let world = MockWorld::new(Behavior {
        capture_stop_failure: Some(StopFailure::Timeout),
        ..Default::default()
    });
    let ctx = context(&world, JobConfig::default(), None);

    let run = JobLifecycle::new(Arc::clone(&ctx), job_in(dir.path(), 0, URL), false)
        .run()
        .await;

    // The file exists but has no trailer
    assert!(run.job.output_path.exists());
    assert!(matches!(run.error, Some(RecorderError::ProcessExitUnexpected(_))));
    assert_eq!(run.job.state, LifecycleState::Failed);
    assert_eq!(
        world.teardown_order(),
        vec!["capture", "browser", "display", "audio"]
    );
    assert!(ctx.allocator.reserved_displays().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_display_collision_moves_to_next_number() {
    let dir = tempfile::tempdir().unwrap();
    let world = MockWorld::new(Behavior {
        busy_displays: vec![99],
        display_collisions: 1,
        ..Default::default()
    });
    let ctx = context(&world, JobConfig::default(), None);

    let run = JobLifecycle::new(Arc::clone(&ctx), job_in(dir.path(), 0, URL), false)
        .run()
        .await;

    assert!(run.is_success(), "job failed: {:?}", run.error);
    // :99 busy externally, :100 collided on start, :101 used
    assert_eq!(run.job.display, Some(101));
    assert_eq!(Calls::get(&world.calls.display_starts), 2);
    assert_eq!(Calls::get(&world.calls.display_stops), 1);
    assert!(ctx.allocator.reserved_displays().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_output_fails_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let world = MockWorld::new(Behavior {
        capture_writes_output: false,
        ..Default::default()
    });
    let ctx = context(&world, JobConfig::default(), None);

    let run = JobLifecycle::new(ctx, job_in(dir.path(), 0, URL), false)
        .run()
        .await;

    assert!(matches!(run.error, Some(RecorderError::ProcessExitUnexpected(_))));
    // Teardown already ran once, on the success path
    assert_eq!(Calls::get(&world.calls.capture_stops), 1);
    assert_eq!(Calls::get(&world.calls.display_stops), 1);
}

#[tokio::test(start_paused = true)]
async fn test_parallel_job_routes_audio_to_private_sink() {
    let dir = tempfile::tempdir().unwrap();
    let world = MockWorld::new(Behavior::default());
    let ctx = context(&world, JobConfig::default(), None);

    let run = JobLifecycle::new(ctx, job_in(dir.path(), 2, URL), true)
        .run()
        .await;

    assert!(run.is_success(), "job failed: {:?}", run.error);
    assert_eq!(run.job.sink_name.as_deref(), Some("pagecap_sink_job3"));
    assert_eq!(
        *world.sink_setups.lock().unwrap(),
        vec![("pagecap_sink_job3".to_string(), true)]
    );
    assert_eq!(Calls::get(&world.calls.audio_routes), 1);
}

#[tokio::test(start_paused = true)]
async fn test_video_only_job_skips_audio() {
    let dir = tempfile::tempdir().unwrap();
    let world = MockWorld::new(Behavior::default());
    let config = JobConfig {
        disable_audio: true,
        ..Default::default()
    };
    let ctx = context(&world, config, None);

    let run = JobLifecycle::new(ctx, job_in(dir.path(), 0, URL), false)
        .run()
        .await;

    assert!(run.is_success(), "job failed: {:?}", run.error);
    assert_eq!(run.job.sink_name, None);
    assert_eq!(Calls::get(&world.calls.audio_setups), 0);
    assert_eq!(world.teardown_order(), vec!["capture", "browser", "display"]);
}

#[tokio::test(start_paused = true)]
async fn test_job_refuses_to_start_after_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let world = MockWorld::new(Behavior::default());
    let ctx = context(&world, JobConfig::default(), None);
    assert_ok!(tokio::time::timeout(
        std::time::Duration::from_secs(30),
        ctx.registry.flush_all("test")
    )
    .await);

    let run = JobLifecycle::new(Arc::clone(&ctx), job_in(dir.path(), 0, URL), false)
        .run()
        .await;

    assert!(matches!(run.error, Some(RecorderError::ProcessExitUnexpected(_))));
    assert_eq!(Calls::get(&world.calls.display_starts), 0);
    assert!(ctx.allocator.reserved_displays().is_empty());
}
