//! Background worker: poll the job store, process pending jobs, wait, repeat.
//!
//! The worker is a single long-running task:
//!
//! ```text
//! Worker::run
//!     │
//!     ├─► list_pending                (JobStore)
//!     ├─► for each job, in order:
//!     │       ├─► extract pages       (spawn_blocking)
//!     │       ├─► process_batch       (BatchDispatcher, N concurrent calls)
//!     │       ├─► persist JSON        (OutputStore)
//!     │       └─► mark_done           (JobStore, first write wins)
//!     └─► wait poll_interval, or until the stop token fires
//! ```
//!
//! A failure anywhere in one job is logged and the job is left `pending`;
//! the next cycle picks it up again. Nothing that happens to one job stops
//! the loop or affects the other jobs of the cycle.
//!
//! ## Stopping
//!
//! Cancelling the [`CancellationToken`] ends the loop at the next safe
//! point: no new job is started after the signal, the inter-cycle wait is
//! cut short, and a job already in flight gets `shutdown_grace` to finish.
//! A job still running after that is dropped and stays `pending`.

use crate::config::ExplainerConfig;
use crate::context::Context;
use crate::error::JobError;
use crate::pipeline::dispatch::BatchDispatcher;
use crate::pipeline::extract::extract_pages;
use crate::store::Job;
use chrono::Utc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Timing knobs of the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Pause between two cycles.
    pub poll_interval: Duration,
    /// How long an in-flight job may run on after the stop signal.
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl From<&ExplainerConfig> for WorkerConfig {
    fn from(config: &ExplainerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            shutdown_grace: config.shutdown_grace,
        }
    }
}

/// What one polling cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Jobs that reached `done`.
    pub processed: usize,
    /// Jobs that failed and stay `pending`.
    pub failed: usize,
    /// Pending jobs not started because the stop signal arrived.
    pub skipped: usize,
}

impl CycleReport {
    pub fn total(&self) -> usize {
        self.processed + self.failed + self.skipped
    }
}

/// Summary of one successfully processed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOutcome {
    pub pages: usize,
    pub failed_pages: usize,
}

/// The background worker. Exactly one runs per database.
pub struct Worker {
    ctx: Context,
    dispatcher: BatchDispatcher,
    config: WorkerConfig,
}

impl Worker {
    /// Create a worker with timings taken from the context's configuration.
    pub fn new(ctx: Context) -> Self {
        let config = WorkerConfig::from(ctx.config.as_ref());
        Self::with_config(ctx, config)
    }

    /// Create with custom timings.
    pub fn with_config(ctx: Context, config: WorkerConfig) -> Self {
        let dispatcher = ctx.dispatcher();
        Self {
            ctx,
            dispatcher,
            config,
        }
    }

    /// Replace the dispatcher (e.g. to attach a progress callback).
    pub fn with_dispatcher(mut self, dispatcher: BatchDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs_f64(),
            shutdown_grace_secs = self.config.shutdown_grace.as_secs(),
            "worker starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let report = self.run_cycle(&shutdown).await;
            if report.total() > 0 {
                info!(
                    processed = report.processed,
                    failed = report.failed,
                    skipped = report.skipped,
                    "cycle finished"
                );
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("worker stopped");
    }

    /// One polling cycle: process every job that is pending right now.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> CycleReport {
        let mut report = CycleReport::default();

        let pending = match self.ctx.store.list_pending() {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "failed to list pending jobs");
                return report;
            }
        };

        if !pending.is_empty() {
            debug!(count = pending.len(), "pending jobs");
        }

        for (idx, job) in pending.iter().enumerate() {
            if shutdown.is_cancelled() {
                report.skipped = pending.len() - idx;
                info!(skipped = report.skipped, "stop requested, not starting more jobs");
                break;
            }

            match self.process_with_grace(job, shutdown).await {
                Ok(outcome) => {
                    report.processed += 1;
                    info!(
                        job_id = %job.id,
                        pages = outcome.pages,
                        failed_pages = outcome.failed_pages,
                        "job done"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(job_id = %job.id, filename = %job.original_filename, error = %e, "job failed, will retry next cycle");
                }
            }
        }

        report
    }

    /// Process a job; once `shutdown` fires it gets `shutdown_grace` more.
    async fn process_with_grace(
        &self,
        job: &Job,
        shutdown: &CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        let work = self.process_job(job);
        tokio::pin!(work);

        tokio::select! {
            result = &mut work => result,
            _ = shutdown.cancelled() => {
                let grace = self.config.shutdown_grace;
                info!(job_id = %job.id, grace_secs = grace.as_secs(), "stop requested, letting in-flight job finish");
                match tokio::time::timeout(grace, &mut work).await {
                    Ok(result) => result,
                    Err(_) => Err(JobError::Abandoned { secs: grace.as_secs() }),
                }
            }
        }
    }

    /// Process one job to completion: extract, dispatch, persist, mark done.
    pub async fn process_job(&self, job: &Job) -> Result<JobOutcome, JobError> {
        let start = Instant::now();
        let upload = self.ctx.upload_path(job);
        if !tokio::fs::try_exists(&upload).await.unwrap_or(false) {
            return Err(JobError::MissingUpload { path: upload });
        }

        info!(job_id = %job.id, filename = %job.original_filename, "processing job");

        let pages = extract_pages(self.ctx.extractor.clone(), &upload).await?;
        let results = self
            .dispatcher
            .process_batch(&pages, job.custom_instruction.as_deref())
            .await;

        if !pages.is_empty() && results.is_empty() {
            return Err(JobError::EmptyBatch { pages: pages.len() });
        }

        self.ctx
            .outputs
            .persist_job(job.id.as_str(), &results)
            .await?;

        if !self.ctx.store.mark_done(job.id.as_str(), Utc::now())? {
            if self.ctx.store.get(job.id.as_str())?.is_none() {
                // Removed while in flight: the output has no record to belong to.
                let removed = self.ctx.outputs.remove(job.id.as_str()).await?;
                info!(job_id = %job.id, removed, "job deleted during processing, output discarded");
            } else {
                // Already done; the first completion stands.
                debug!(job_id = %job.id, "job was not pending, completion ignored");
            }
        }

        debug!(
            job_id = %job.id,
            duration_ms = start.elapsed().as_millis() as u64,
            "job finished"
        );

        Ok(JobOutcome {
            pages: results.len(),
            failed_pages: results.iter().filter(|r| !r.is_ok()).count(),
        })
    }
}
