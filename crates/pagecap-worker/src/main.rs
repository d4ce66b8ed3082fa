//! Page recorder binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgGroup, Parser};
use tracing::{error, info};

use pagecap_media::{
    AudioServer, ChromeBrowser, DisplayProbe, FfmpegCapture, ProcessRegistry, PulseAudio,
    XvfbDisplay,
};
use pagecap_models::{validate_page_url, CaptureJob, JobId, Resolution};
use pagecap_worker::logging::init_tracing;
use pagecap_worker::metrics::init_metrics;
use pagecap_worker::{
    load_url_list, plan_batch, spawn_shutdown_handler, BatchScheduler, Collaborators, JobContext,
    JobLifecycle, RecorderConfig, ResourceAllocator,
};

/// Record the playback of web page media to video files.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[command(group(ArgGroup::new("mode").required(true).args(["url", "batch"])))]
struct Cli {
    /// Page to record
    #[arg(long, requires = "output")]
    url: Option<String>,

    /// Output file for --url
    #[arg(short, long, requires = "url")]
    output: Option<PathBuf>,

    /// File with one URL per line
    #[arg(long, requires = "output_dir")]
    batch: Option<PathBuf>,

    /// Output directory for --batch
    #[arg(long, requires = "batch")]
    output_dir: Option<PathBuf>,

    /// Maximum jobs recording at the same time in batch mode
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// Recording length in seconds when the media duration is unknown
    #[arg(long)]
    duration: Option<u64>,

    /// Always use --duration instead of the media's own duration
    #[arg(long)]
    no_auto_duration: bool,

    /// Selector of the media element
    #[arg(long)]
    selector: Option<String>,

    /// Element to click before looking for the media (repeatable)
    #[arg(long = "click")]
    click: Vec<String>,

    /// Display and recording size, e.g. 1280x720
    #[arg(long)]
    resolution: Option<Resolution>,

    #[arg(long)]
    framerate: Option<u32>,

    #[arg(long)]
    crf: Option<u8>,

    #[arg(long)]
    preset: Option<String>,

    #[arg(long)]
    audio_bitrate: Option<String>,

    /// Extra seconds recorded after the media ends
    #[arg(long)]
    buffer: Option<u64>,

    /// Leave the page layout as is
    #[arg(long)]
    no_fullscreen: bool,

    /// Record video only
    #[arg(long)]
    no_audio: bool,

    /// First display number to probe
    #[arg(long)]
    display_start: Option<u32>,

    /// Browser executable
    #[arg(long)]
    browser: Option<PathBuf>,

    /// Print the batch plan and exit
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    fn apply(&self, config: &mut RecorderConfig) {
        let job = &mut config.job;
        if let Some(n) = self.concurrency {
            config.max_concurrent_jobs = n;
        }
        if let Some(secs) = self.duration {
            job.fallback_duration = Some(secs);
        }
        if self.no_auto_duration {
            job.auto_duration = false;
        }
        if let Some(selector) = &self.selector {
            job.media_selector = selector.clone();
        }
        if !self.click.is_empty() {
            job.click_selectors = self.click.clone();
        }
        if let Some(resolution) = self.resolution {
            job.capture.resolution = resolution;
        }
        if let Some(framerate) = self.framerate {
            job.capture.framerate = framerate;
        }
        if let Some(crf) = self.crf {
            job.capture.crf = crf;
        }
        if let Some(preset) = &self.preset {
            job.capture.preset = preset.clone();
        }
        if let Some(bitrate) = &self.audio_bitrate {
            job.capture.audio_bitrate = bitrate.clone();
        }
        if let Some(buffer) = self.buffer {
            job.capture.buffer_secs = buffer;
        }
        if self.no_fullscreen {
            job.fullscreen = false;
        }
        if self.no_audio {
            job.disable_audio = true;
        }
        if let Some(start) = self.display_start {
            job.display_start = start;
        }
        if let Some(browser) = &self.browser {
            job.browser_executable = Some(browser.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let mut config = RecorderConfig::from_env();
    cli.apply(&mut config);
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let plan = match (&cli.batch, &cli.output_dir) {
        (Some(list), Some(dir)) => {
            let urls = load_url_list(list).await?;
            Some(plan_batch(&urls, dir))
        }
        _ => {
            if let Some(url) = &cli.url {
                if let Err(e) = validate_page_url(url) {
                    error!("Invalid configuration: {}", e);
                    std::process::exit(1);
                }
            }
            None
        }
    };

    if cli.dry_run {
        match &plan {
            Some(plan) => {
                for job in plan {
                    println!("{}\t{}\t{}", job.job_id, job.url, job.output_path.display());
                }
            }
            None => println!("{:#?}", config),
        }
        return Ok(());
    }

    if let Some(addr) = config.metrics_addr {
        init_metrics(addr)?;
        info!("Serving metrics on http://{}/metrics", addr);
    }

    let registry = Arc::new(ProcessRegistry::new());
    spawn_shutdown_handler(Arc::clone(&registry)).context("installing signal handlers")?;

    let job_config = Arc::new(config.job.clone());
    let xvfb = Arc::new(XvfbDisplay::new(
        Arc::clone(&registry),
        job_config.display_startup_timeout,
        job_config.display_stop_grace,
    ));
    let probe: Arc<dyn DisplayProbe> = xvfb.clone();
    let audio: Option<Arc<dyn AudioServer>> = if job_config.disable_audio {
        None
    } else {
        Some(Arc::new(PulseAudio::new(job_config.audio_startup_timeout)?))
    };
    let browser = ChromeBrowser::new(
        Arc::clone(&registry),
        job_config.browser_executable.clone(),
    )
    .with_args(job_config.browser_args.clone());

    let ctx = Arc::new(JobContext {
        registry: Arc::clone(&registry),
        allocator: Arc::new(ResourceAllocator::new(probe)),
        collaborators: Collaborators {
            display: xvfb,
            audio,
            capture: Arc::new(FfmpegCapture::new(Arc::clone(&registry))),
            browser: Arc::new(browser),
        },
        config: Arc::clone(&job_config),
        observer: None,
    });
    ctx.register_shutdown_cleanup();

    let success = match (plan, &cli.url, &cli.output) {
        (Some(plan), _, _) => {
            let scheduler = BatchScheduler::new(ctx, config.max_concurrent_jobs);
            let summary = scheduler.run(plan).await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            summary.is_success()
        }
        (None, Some(url), Some(output)) => {
            let job = CaptureJob::new(
                JobId::new(),
                url.clone(),
                output.clone(),
                job_config.capture.clone(),
            );
            let run = JobLifecycle::new(ctx, job, false).run().await;
            if let Some(e) = &run.error {
                error!("Recording failed ({}): {}", e.kind(), e);
            }
            run.is_success()
        }
        _ => anyhow::bail!("either --url/--output or --batch/--output-dir is required"),
    };

    registry.flush_all("exit").await;
    info!("Recorder finished");
    std::process::exit(if success { 0 } else { 1 });
}
