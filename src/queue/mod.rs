//! Persistent job queue and the worker that drains it.
//!
//! Jobs live in the `jobs` table. Claiming uses a `BEGIN IMMEDIATE`
//! transaction, so any number of workers (threads or processes) can share
//! one database file.

pub mod models;
pub mod store;
pub mod worker;

pub use models::{FailOutcome, Job, JobStatus, JobType, PushOptions, QueueStats};
pub use store::RunJobPush;
pub use worker::{JobWorker, WorkerSettings, WorkerSummary};

use crate::db::{DbHandle, now_ms};
use crate::errors::QueueError;

/// Async facade over the queue tables.
#[derive(Clone)]
pub struct JobQueue {
    db: DbHandle,
    defaults: PushOptions,
}

impl JobQueue {
    pub fn new(db: DbHandle) -> Self {
        Self {
            db,
            defaults: PushOptions::default(),
        }
    }

    /// Override the priority and attempt limit new jobs get.
    pub fn with_defaults(mut self, priority: i64, max_attempts: i64) -> Self {
        self.defaults.priority = priority;
        self.defaults.max_attempts = max_attempts;
        self
    }

    /// Push options prefilled with the queue defaults.
    pub fn options(&self) -> PushOptions {
        self.defaults.clone()
    }

    pub async fn push(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        opts: PushOptions,
    ) -> Result<Job, QueueError> {
        self.db
            .call(move |db| db.push_job(job_type, &payload, &opts, now_ms()))
            .await
            .map_err(QueueError::Database)
    }

    /// Push a job for `opts.run_id` unless the run already has an open one,
    /// completing `finishing` in the same transaction.
    pub async fn push_for_run(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        opts: PushOptions,
        finishing: Option<i64>,
    ) -> Result<RunJobPush, QueueError> {
        self.db
            .call(move |db| db.push_run_job(job_type, &payload, &opts, finishing, now_ms()))
            .await
            .map_err(QueueError::Database)
    }

    pub async fn pop(&self) -> Result<Option<Job>, QueueError> {
        self.pop_at(now_ms()).await
    }

    pub async fn pop_at(&self, now: i64) -> Result<Option<Job>, QueueError> {
        self.db
            .call(move |db| db.pop_job_at(now))
            .await
            .map_err(QueueError::Database)
    }

    pub async fn complete(&self, id: i64) -> Result<(), QueueError> {
        let found = self
            .db
            .call(move |db| db.complete_job(id, now_ms()))
            .await
            .map_err(QueueError::Database)?;
        if found {
            Ok(())
        } else {
            Err(QueueError::JobNotFound { id })
        }
    }

    pub async fn fail(&self, id: i64, error: &str) -> Result<FailOutcome, QueueError> {
        let error = error.to_string();
        self.db
            .call(move |db| db.fail_job(id, &error, now_ms()))
            .await
            .map_err(QueueError::Database)?
            .ok_or(QueueError::JobNotFound { id })
    }

    pub async fn fail_terminal(&self, id: i64, error: &str) -> Result<(), QueueError> {
        let error = error.to_string();
        let found = self
            .db
            .call(move |db| db.fail_job_terminal(id, &error, now_ms()))
            .await
            .map_err(QueueError::Database)?;
        if found {
            Ok(())
        } else {
            Err(QueueError::JobNotFound { id })
        }
    }

    pub async fn reset_stuck(&self, threshold_minutes: u64) -> Result<usize, QueueError> {
        self.db
            .call(move |db| db.reset_stuck_jobs_at(threshold_minutes, now_ms()))
            .await
            .map_err(QueueError::Database)
    }

    pub async fn cleanup(&self, days_old: u64) -> Result<usize, QueueError> {
        self.db
            .call(move |db| db.cleanup_jobs_at(days_old, now_ms()))
            .await
            .map_err(QueueError::Database)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.db
            .call(|db| db.queue_stats())
            .await
            .map_err(QueueError::Database)
    }

    pub async fn get(&self, id: i64) -> Result<Job, QueueError> {
        self.db
            .call(move |db| db.get_job(id))
            .await
            .map_err(QueueError::Database)?
            .ok_or(QueueError::JobNotFound { id })
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        self.db
            .call(move |db| db.list_jobs(limit))
            .await
            .map_err(QueueError::Database)
    }
}
