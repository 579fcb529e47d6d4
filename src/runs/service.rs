use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use tracing::info;

use super::db::CancelOutcome;
use super::models::{Phase, Repo, Run, RunDetail, RunStep};
use super::state::next_phase;
use crate::apply::BackupStore;
use crate::checkpoint::GitCheckpoint;
use crate::config::CoderunConfig;
use crate::db::{Db, DbHandle};
use crate::errors::RunError;
use crate::lock::RepoLocks;
use crate::phases::{PhaseExecutors, PhaseSettings, ReasoningService};
use crate::queue::{Job, JobQueue, JobType, PushOptions, QueueStats, RunJobPush};
use crate::safety::SafetyGate;

/// Entry point for everything a client can do with repos and runs.
#[derive(Clone)]
pub struct RunService {
    db: DbHandle,
    executors: PhaseExecutors,
    queue: JobQueue,
}

impl RunService {
    pub fn new(db: DbHandle, executors: PhaseExecutors, queue: JobQueue) -> Self {
        Self {
            db,
            executors,
            queue,
        }
    }

    /// Open the configured database and wire every component from `config`.
    pub fn from_config(
        config: &CoderunConfig,
        reasoner: Arc<dyn ReasoningService>,
    ) -> anyhow::Result<Self> {
        let db = DbHandle::new(Db::open(&config.db_path())?);
        Self::with_db(db, config, reasoner)
    }

    pub fn with_db(
        db: DbHandle,
        config: &CoderunConfig,
        reasoner: Arc<dyn ReasoningService>,
    ) -> anyhow::Result<Self> {
        let toml = &config.toml;
        let safety = SafetyGate::new(&toml.safety.blocked_paths)?;
        let executors = PhaseExecutors::new(
            db.clone(),
            reasoner,
            safety,
            BackupStore::new(config.backups_dir()),
            GitCheckpoint::new(
                toml.checkpoint.author_name.clone(),
                toml.checkpoint.author_email.clone(),
            ),
            RepoLocks::new(config.locks_dir(), config.lock_wait()),
            PhaseSettings {
                reasoning_timeout: config.reasoning_timeout(),
                max_file_bytes: toml.reasoning.max_file_bytes,
                max_listing: toml.reasoning.max_listing,
                stale_step_minutes: toml.worker.stuck_threshold_minutes,
            },
        );
        let queue = JobQueue::new(db.clone())
            .with_defaults(toml.queue.default_priority, toml.queue.max_attempts);
        Ok(Self::new(db, executors, queue))
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn backups(&self) -> &BackupStore {
        self.executors.backups()
    }

    // ── Repos ─────────────────────────────────────────────────────────

    /// Register a directory as a target repository. The path is stored
    /// canonicalized.
    pub async fn register_repo(
        &self,
        name: &str,
        path: &Path,
        allowed_path_prefixes: Vec<String>,
    ) -> Result<Repo, RunError> {
        let canonical = path
            .canonicalize()
            .with_context(|| format!("Repository path {} does not exist", path.display()))?;
        if !canonical.is_dir() {
            return Err(anyhow::anyhow!("{} is not a directory", canonical.display()).into());
        }
        let name = name.to_string();
        let base_path = canonical.to_string_lossy().into_owned();
        let repo = self
            .db
            .call(move |db| db.register_repo(&name, &base_path, &allowed_path_prefixes))
            .await
            .map_err(RunError::Database)?;
        info!(repo_id = repo.id, path = %repo.base_path, "repository registered");
        Ok(repo)
    }

    pub async fn get_repo(&self, repo_id: i64) -> Result<Repo, RunError> {
        self.db
            .call(move |db| db.get_repo(repo_id))
            .await
            .map_err(RunError::Database)?
            .ok_or(RunError::RepoNotFound { id: repo_id })
    }

    pub async fn list_repos(&self) -> Result<Vec<Repo>, RunError> {
        self.db
            .call(|db| db.list_repos())
            .await
            .map_err(RunError::Database)
    }

    pub async fn set_repo_flags(
        &self,
        repo_id: i64,
        read_only: Option<bool>,
        maintenance_locked: Option<bool>,
    ) -> Result<Repo, RunError> {
        self.get_repo(repo_id).await?;
        self.db
            .call(move |db| db.set_repo_flags(repo_id, read_only, maintenance_locked))
            .await
            .map_err(RunError::Database)
    }

    // ── Runs ──────────────────────────────────────────────────────────

    pub async fn create_run(
        &self,
        repo_id: i64,
        request_text: &str,
        user_id: Option<String>,
        thread_id: Option<String>,
    ) -> Result<Run, RunError> {
        if request_text.trim().is_empty() {
            return Err(anyhow::anyhow!("request text is empty").into());
        }
        self.get_repo(repo_id).await?;
        let request_text = request_text.to_string();
        let run = self
            .db
            .call(move |db| {
                db.create_run(repo_id, &request_text, user_id.as_deref(), thread_id.as_deref())
            })
            .await
            .map_err(RunError::Database)?;
        info!(run_id = run.id, repo_id, "run created");
        Ok(run)
    }

    pub async fn get_run(&self, run_id: i64) -> Result<Run, RunError> {
        self.db
            .call(move |db| db.get_run(run_id))
            .await
            .map_err(RunError::Database)?
            .ok_or(RunError::RunNotFound { id: run_id })
    }

    pub async fn get_run_detail(&self, run_id: i64) -> Result<RunDetail, RunError> {
        self.db
            .call(move |db| db.get_run_detail(run_id))
            .await
            .map_err(RunError::Database)?
            .ok_or(RunError::RunNotFound { id: run_id })
    }

    pub async fn list_runs(&self, limit: usize) -> Result<Vec<Run>, RunError> {
        self.db
            .call(move |db| db.list_runs(limit))
            .await
            .map_err(RunError::Database)
    }

    pub async fn run_steps(&self, run_id: i64) -> Result<Vec<RunStep>, RunError> {
        self.get_run(run_id).await?;
        self.db
            .call(move |db| db.list_steps(run_id))
            .await
            .map_err(RunError::Database)
    }

    /// Execute one phase of a run synchronously.
    pub async fn advance_phase(&self, run_id: i64, phase: Phase) -> Result<Run, RunError> {
        self.executors.execute(run_id, phase).await
    }

    pub async fn plan(&self, run_id: i64) -> Result<Run, RunError> {
        self.executors.plan(run_id).await
    }

    pub async fn code(&self, run_id: i64) -> Result<Run, RunError> {
        self.executors.code(run_id).await
    }

    pub async fn review(&self, run_id: i64) -> Result<Run, RunError> {
        self.executors.review(run_id).await
    }

    pub async fn apply(&self, run_id: i64) -> Result<Run, RunError> {
        self.executors.apply(run_id).await
    }

    pub async fn rollback(&self, run_id: i64) -> Result<Run, RunError> {
        self.executors.rollback(run_id).await
    }

    /// Cancel a run that has not started applying, and drop its queued jobs.
    pub async fn cancel(&self, run_id: i64, reason: &str) -> Result<Run, RunError> {
        let message = reason.to_string();
        let outcome = self
            .db
            .call(move |db| db.cancel_run(run_id, &message))
            .await
            .map_err(RunError::Database)?;
        match outcome {
            CancelOutcome::Cancelled { run, dropped_jobs } => {
                info!(run_id, dropped_jobs, "run cancelled");
                Ok(run)
            }
            CancelOutcome::Rejected(status) => Err(RunError::conflict(
                run_id,
                status,
                format!("a {} run cannot be cancelled", status),
            )),
            CancelOutcome::NotFound => Err(RunError::RunNotFound { id: run_id }),
        }
    }

    // ── Queue ─────────────────────────────────────────────────────────

    /// Queue the job for the run's next phase.
    pub async fn enqueue(&self, run_id: i64) -> Result<Job, RunError> {
        let run = self.get_run(run_id).await?;
        let Some(phase) = next_phase(&run) else {
            return Err(RunError::conflict(run_id, run.status, "run has no phase left to queue"));
        };
        let opts = self.queue.options().user(run.user_id.clone());
        self.enqueue_phase(run_id, phase, opts).await
    }

    /// Queue `phase` for a run, refusing if the run already has an open job.
    pub async fn enqueue_phase(
        &self,
        run_id: i64,
        phase: Phase,
        opts: PushOptions,
    ) -> Result<Job, RunError> {
        match self.push_phase(run_id, phase, opts, None).await? {
            RunJobPush::Queued(job) => Ok(job),
            RunJobPush::Busy(open) => {
                let run = self.get_run(run_id).await?;
                Err(RunError::conflict(
                    run_id,
                    run.status,
                    format!("job {} is already queued for this run", open.id),
                ))
            }
        }
    }

    /// Complete job `finished` and queue `phase` for its run in one step.
    ///
    /// When the run already has another open job, `finished` is completed on
    /// its own and that job carries the run forward.
    pub async fn hand_off(
        &self,
        finished: i64,
        run_id: i64,
        phase: Phase,
        opts: PushOptions,
    ) -> Result<Option<Job>, RunError> {
        match self.push_phase(run_id, phase, opts, Some(finished)).await? {
            RunJobPush::Queued(job) => Ok(Some(job)),
            RunJobPush::Busy(open) => {
                info!(run_id, job_id = open.id, "run already has an open job");
                self.queue.complete(finished).await?;
                Ok(None)
            }
        }
    }

    async fn push_phase(
        &self,
        run_id: i64,
        phase: Phase,
        opts: PushOptions,
        finishing: Option<i64>,
    ) -> Result<RunJobPush, RunError> {
        let Some(job_type) = JobType::for_phase(phase) else {
            let run = self.get_run(run_id).await?;
            return Err(RunError::conflict(run_id, run.status, format!("{} cannot be queued", phase)));
        };
        let pushed = self
            .queue
            .push_for_run(job_type, json!({ "run_id": run_id }), opts.for_run(run_id), finishing)
            .await?;
        if let RunJobPush::Queued(job) = &pushed {
            info!(run_id, job_id = job.id, job_type = %job.job_type, "job queued");
        }
        Ok(pushed)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, RunError> {
        Ok(self.queue.stats().await?)
    }
}
