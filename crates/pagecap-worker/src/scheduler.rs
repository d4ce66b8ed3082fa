//! Batch scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use pagecap_models::{output_file_name, BatchResult, BatchSummary, CaptureJob, JobId};

use crate::lifecycle::{JobContext, JobLifecycle};

/// One URL of a batch with its precomputed job id and output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedJob {
    pub index: usize,
    pub job_id: JobId,
    pub url: String,
    pub output_path: PathBuf,
}

/// Assign job ids and deterministic output paths before anything runs.
pub fn plan_batch(urls: &[String], output_dir: &Path) -> Vec<PlannedJob> {
    urls.iter()
        .enumerate()
        .map(|(index, url)| PlannedJob {
            index,
            job_id: JobId::for_index(index),
            url: url.clone(),
            output_path: output_dir.join(output_file_name(index, url)),
        })
        .collect()
}

/// Runs planned jobs with at most `max_concurrent_jobs` in flight.
///
/// Jobs are admitted in list order. With a limit of one the batch is strictly
/// sequential and each job runs in single mode (shared default sink).
pub struct BatchScheduler {
    ctx: Arc<JobContext>,
    max_concurrent_jobs: usize,
    job_semaphore: Arc<Semaphore>,
}

impl BatchScheduler {
    pub fn new(ctx: Arc<JobContext>, max_concurrent_jobs: usize) -> Self {
        let max_concurrent_jobs = max_concurrent_jobs.max(1);
        Self {
            ctx,
            max_concurrent_jobs,
            job_semaphore: Arc::new(Semaphore::new(max_concurrent_jobs)),
        }
    }

    pub fn max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs
    }

    /// Run every planned job and collect one result per job, ordered by
    /// position in the list. One job failing never stops its siblings.
    pub async fn run(&self, plan: Vec<PlannedJob>) -> BatchSummary {
        let parallel = self.max_concurrent_jobs > 1;
        info!(
            "Starting batch of {} jobs with {} max concurrent jobs",
            plan.len(),
            self.max_concurrent_jobs
        );

        let mut handles = Vec::with_capacity(plan.len());
        let mut results = Vec::with_capacity(plan.len());

        for planned in plan {
            let permit = match Arc::clone(&self.job_semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    results.push(BatchResult::failed(
                        planned.index,
                        planned.job_id,
                        planned.url,
                        planned.output_path,
                        "scheduler_closed",
                        "Job slots were closed before the job started",
                    ));
                    continue;
                }
            };

            let ctx = Arc::clone(&self.ctx);
            let job = CaptureJob::new(
                planned.job_id.clone(),
                planned.url.clone(),
                planned.output_path.clone(),
                ctx.config.capture.clone(),
            );

            let handle = tokio::spawn(async move {
                let _permit = permit;
                JobLifecycle::new(ctx, job, parallel).run().await
            });
            handles.push((planned, handle));
        }

        for (planned, handle) in handles {
            match handle.await {
                Ok(run) => results.push(BatchResult::from_job(planned.index, &run.job)),
                Err(e) => {
                    error!("Job {} task aborted: {}", planned.job_id, e);
                    results.push(BatchResult::failed(
                        planned.index,
                        planned.job_id,
                        planned.url,
                        planned.output_path,
                        "aborted",
                        e.to_string(),
                    ));
                }
            }
        }

        let summary = BatchSummary::new(results);
        log_summary(&summary);
        summary
    }
}

fn log_summary(summary: &BatchSummary) {
    info!(
        "Batch finished: {}/{} succeeded, {} failed",
        summary.succeeded(),
        summary.total(),
        summary.failed()
    );
    for failure in summary.failures() {
        warn!(
            job_id = %failure.job_id,
            url = %failure.url,
            kind = failure.error_kind.as_deref().unwrap_or("unknown"),
            "Job failed: {}",
            failure.error.as_deref().unwrap_or("no details")
        );
    }
}
