//! Drains the job queue: phase jobs drive runs forward, maintenance jobs
//! prune old jobs and backups.

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use super::models::{FailOutcome, Job, JobType};
use crate::errors::{QueueError, RunError};
use crate::runs::state::{next_phase, phase_output_missing};
use crate::runs::{Phase, Run, RunService};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// How long one `drain` may keep claiming jobs.
    pub budget: Duration,
    /// Pause between drains in `serve`.
    pub poll_interval: Duration,
    pub stuck_threshold_minutes: u64,
    pub cleanup_days: u64,
    pub backup_retention: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            budget: Duration::from_secs(55),
            poll_interval: Duration::from_secs(5),
            stuck_threshold_minutes: 30,
            cleanup_days: 7,
            backup_retention: Duration::from_secs(14 * 24 * 3600),
        }
    }
}

impl WorkerSettings {
    pub fn from_config(config: &crate::config::CoderunConfig) -> Self {
        let toml = &config.toml;
        Self {
            budget: config.worker_budget(),
            poll_interval: Duration::from_secs(toml.worker.poll_interval_secs.max(1)),
            stuck_threshold_minutes: toml.worker.stuck_threshold_minutes,
            cleanup_days: toml.queue.cleanup_days,
            backup_retention: config.backup_retention(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub processed: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl WorkerSummary {
    fn absorb(&mut self, other: WorkerSummary) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.elapsed += other.elapsed;
    }
}

/// How one job should be closed.
enum JobResult {
    /// Completed; queue `Some(phase)` next for the same run.
    Done(Option<(i64, Phase)>),
    /// Retry with backoff while attempts remain.
    Retry(String),
    /// Fail without retrying.
    Terminal(String),
}

#[derive(Clone)]
pub struct JobWorker {
    service: RunService,
    settings: WorkerSettings,
}

impl JobWorker {
    pub fn new(service: RunService, settings: WorkerSettings) -> Self {
        Self { service, settings }
    }

    /// Process jobs until the queue is empty or `budget` is spent.
    ///
    /// The budget is checked between jobs; a job in flight always finishes.
    #[instrument(skip(self))]
    pub async fn drain(&self, budget: Duration) -> Result<WorkerSummary, QueueError> {
        let start = Instant::now();
        let queue = self.service.queue();
        let reset = queue.reset_stuck(self.settings.stuck_threshold_minutes).await?;
        if reset > 0 {
            warn!(jobs = reset, "released stuck jobs");
        }

        let mut summary = WorkerSummary::default();
        while start.elapsed() < budget {
            let Some(job) = queue.pop().await? else {
                break;
            };
            summary.processed += 1;
            if !self.process(job).await? {
                summary.failed += 1;
            }
        }
        summary.elapsed = start.elapsed();
        if summary.processed > 0 {
            info!(
                processed = summary.processed,
                failed = summary.failed,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "queue drained"
            );
        }
        Ok(summary)
    }

    /// Drain the queue on every tick until `shutdown` turns true.
    ///
    /// A drain in progress is allowed to finish before the loop exits.
    pub async fn serve(&self, mut shutdown: watch::Receiver<bool>) -> WorkerSummary {
        let mut total = WorkerSummary::default();
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            poll_secs = self.settings.poll_interval.as_secs(),
            "worker serving"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    match self.drain(self.settings.budget).await {
                        Ok(summary) => total.absorb(summary),
                        Err(e) => error!(error = %e, "queue drain failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(processed = total.processed, failed = total.failed, "worker stopped");
        total
    }

    /// Run one claimed job and close it. Returns whether it succeeded.
    async fn process(&self, job: Job) -> Result<bool, QueueError> {
        debug!(job_id = job.id, job_type = %job.job_type, attempt = job.attempts, "processing job");
        let result = match job.job_type.phase() {
            Some(_) => self.run_phase_job(&job).await,
            None => self.run_maintenance_job(&job).await,
        };

        let queue = self.service.queue();
        match result {
            JobResult::Done(None) => {
                queue.complete(job.id).await?;
                Ok(true)
            }
            JobResult::Done(Some((run_id, phase))) => {
                let opts = queue
                    .options()
                    .priority(job.priority)
                    .user(job.user_id.clone());
                match self.service.hand_off(job.id, run_id, phase, opts).await {
                    Ok(_) => Ok(true),
                    Err(e) => {
                        // The job stays open; its retry only redoes the hand-off.
                        error!(run_id, %phase, error = %e, "failed to queue next phase");
                        queue
                            .fail(job.id, &format!("failed to queue {}: {}", phase, e))
                            .await?;
                        Ok(false)
                    }
                }
            }
            JobResult::Retry(message) => {
                match queue.fail(job.id, &message).await? {
                    FailOutcome::Retrying { scheduled_at } => {
                        warn!(job_id = job.id, scheduled_at, error = %message, "job will be retried")
                    }
                    FailOutcome::Exhausted => {
                        warn!(job_id = job.id, error = %message, "job out of attempts")
                    }
                }
                Ok(false)
            }
            JobResult::Terminal(message) => {
                warn!(job_id = job.id, error = %message, "job failed");
                queue.fail_terminal(job.id, &message).await?;
                Ok(false)
            }
        }
    }

    async fn run_phase_job(&self, job: &Job) -> JobResult {
        let Some(phase) = job.job_type.phase() else {
            return JobResult::Terminal(format!("{} is not a phase job", job.job_type));
        };
        let run_id = match job.target_run() {
            Ok(id) => id,
            Err(e) => return JobResult::Terminal(e.to_string()),
        };

        match self.service.get_run(run_id).await {
            // A retry after a failed hand-off finds its own phase done.
            Ok(run) if phase_already_done(phase, &run) => {
                return JobResult::Done(next_phase(&run).map(|next| (run_id, next)));
            }
            Ok(_) => {}
            Err(e) => return classify(&e),
        }

        match self.service.advance_phase(run_id, phase).await {
            // Review only leads to apply when it left the run ready.
            Ok(run) => JobResult::Done(next_phase(&run).map(|next| (run_id, next))),
            Err(e) => classify(&e),
        }
    }

    async fn run_maintenance_job(&self, job: &Job) -> JobResult {
        match job.job_type {
            JobType::Cleanup => {
                let days = match job.payload_u64("days") {
                    Ok(days) => days.unwrap_or(self.settings.cleanup_days),
                    Err(e) => return JobResult::Terminal(e.to_string()),
                };
                match self.service.queue().cleanup(days).await {
                    Ok(deleted) => {
                        info!(deleted, days, "old jobs removed");
                        JobResult::Done(None)
                    }
                    Err(e) => JobResult::Retry(e.to_string()),
                }
            }
            JobType::BackupCleanup => {
                let retention = match job.payload_u64("retention_days") {
                    Ok(Some(days)) => Duration::from_secs(days * 24 * 3600),
                    Ok(None) => self.settings.backup_retention,
                    Err(e) => return JobResult::Terminal(e.to_string()),
                };
                let backups = self.service.backups().clone();
                match tokio::task::spawn_blocking(move || backups.cleanup(retention)).await {
                    Ok(Ok(removed)) => {
                        info!(removed, "old backups removed");
                        JobResult::Done(None)
                    }
                    Ok(Err(e)) => JobResult::Retry(format!("{:#}", e)),
                    Err(e) => JobResult::Retry(e.to_string()),
                }
            }
            other => JobResult::Terminal(format!("{} is not a maintenance job", other)),
        }
    }
}

/// Whether `phase` already stored its output and the run moved past it.
fn phase_already_done(phase: Phase, run: &Run) -> bool {
    !run.status.is_terminal()
        && !phase_output_missing(phase, run)
        && next_phase(run).is_some_and(|next| next != phase)
}

/// Map a phase error onto the queue's retry policy.
fn classify(error: &RunError) -> JobResult {
    match error {
        // Nothing was touched; try again later.
        e if e.is_retryable() => JobResult::Retry(e.to_string()),
        // Retrying cannot change the outcome.
        RunError::Conflict { .. }
        | RunError::RepoPolicy { .. }
        | RunError::RunNotFound { .. }
        | RunError::RepoNotFound { .. } => JobResult::Terminal(error.to_string()),
        // The run is already failed; the job still records the attempt.
        other => JobResult::Retry(other.to_string()),
    }
}
