use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Transaction, TransactionBehavior, params};

use super::models::*;
use crate::db::Db;

const JOB_COLUMNS: &str = "id, job_type, payload, priority, status, attempts, max_attempts, \
     run_id, user_id, scheduled_at, started_at, completed_at, error_message, created_at";

const MINUTE_MS: i64 = 60_000;

/// Delay before retry number `attempts + 1`: 2^attempts minutes.
pub fn backoff_ms(attempts: i64) -> i64 {
    let exp = attempts.clamp(0, 20) as u32;
    2_i64.pow(exp) * MINUTE_MS
}

/// Outcome of [`Db::push_run_job`].
#[derive(Debug)]
pub enum RunJobPush {
    Queued(Job),
    /// The run already has this open job; nothing was written.
    Busy(Job),
}

impl Db {
    pub fn push_job(
        &self,
        job_type: JobType,
        payload: &serde_json::Value,
        opts: &PushOptions,
        now: i64,
    ) -> Result<Job> {
        let priority = opts.priority.clamp(PRIORITY_RANGE.0, PRIORITY_RANGE.1);
        let max_attempts = opts.max_attempts.max(1);
        let scheduled_at = opts.scheduled_at.unwrap_or(now);
        self.conn
            .execute(
                "INSERT INTO jobs (job_type, payload, priority, max_attempts, run_id, user_id,
                    scheduled_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    job_type.as_str(),
                    serde_json::to_string(payload)?,
                    priority,
                    max_attempts,
                    opts.run_id,
                    opts.user_id,
                    scheduled_at,
                    now,
                ],
            )
            .context("Failed to insert job")?;
        let id = self.conn.last_insert_rowid();
        self.get_job(id)?.context("Job not found after insert")
    }

    /// Claim the most urgent eligible job as of `now`.
    ///
    /// Selection and claim happen inside one `BEGIN IMMEDIATE` transaction,
    /// so two connections can never claim the same job.
    pub fn pop_job_at(&self, now: i64) -> Result<Option<Job>> {
        // Safety: see Db::immediate_tx in runs::db.
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin claim transaction")?;
        let candidate: Option<i64> = tx
            .query_row(
                "SELECT id FROM jobs
                 WHERE status = 'pending' AND scheduled_at <= ?1 AND attempts < max_attempts
                 ORDER BY priority ASC, scheduled_at ASC, id ASC
                 LIMIT 1",
                params![now],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to select job")?;
        let Some(id) = candidate else {
            return Ok(None);
        };
        let claimed = tx
            .execute(
                "UPDATE jobs SET status = 'running', attempts = attempts + 1, started_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![now, id],
            )
            .context("Failed to claim job")?;
        if claimed == 0 {
            return Ok(None);
        }
        let job = tx
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                read_job_row,
            )
            .context("Failed to read claimed job")?
            .into_job()?;
        tx.commit().context("Failed to commit claim")?;
        Ok(Some(job))
    }

    /// Returns `false` when no job has that id.
    pub fn complete_job(&self, id: i64, now: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'completed', completed_at = ?1, error_message = NULL
                 WHERE id = ?2",
                params![now, id],
            )
            .context("Failed to complete job")?;
        Ok(changed > 0)
    }

    /// Record a failed attempt: back to `pending` with exponential backoff
    /// while attempts remain, otherwise `failed`. `None` when no job has that id.
    pub fn fail_job(&self, id: i64, error: &str, now: i64) -> Result<Option<FailOutcome>> {
        let row: Option<(i64, i64)> = self
            .conn
            .query_row(
                "SELECT attempts, max_attempts FROM jobs WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to read job attempts")?;
        let Some((attempts, max_attempts)) = row else {
            return Ok(None);
        };
        if attempts < max_attempts {
            let scheduled_at = now + backoff_ms(attempts);
            self.conn
                .execute(
                    "UPDATE jobs SET status = 'pending', scheduled_at = ?1, error_message = ?2,
                        started_at = NULL
                     WHERE id = ?3",
                    params![scheduled_at, error, id],
                )
                .context("Failed to reschedule job")?;
            Ok(Some(FailOutcome::Retrying { scheduled_at }))
        } else {
            self.fail_job_terminal(id, error, now)?;
            Ok(Some(FailOutcome::Exhausted))
        }
    }

    /// Fail a job for good, regardless of remaining attempts.
    pub fn fail_job_terminal(&self, id: i64, error: &str, now: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'failed', error_message = ?1, completed_at = ?2
                 WHERE id = ?3",
                params![error, now, id],
            )
            .context("Failed to fail job")?;
        Ok(changed > 0)
    }

    /// Release jobs left `running` longer than `threshold_minutes`, which
    /// means their worker died. Attempts are not touched; jobs without
    /// attempts left are failed instead.
    pub fn reset_stuck_jobs_at(&self, threshold_minutes: u64, now: i64) -> Result<usize> {
        let cutoff = now - threshold_minutes as i64 * MINUTE_MS;
        let message = format!("timed out after {} minutes", threshold_minutes);
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin reset transaction")?;
        let retried = tx
            .execute(
                "UPDATE jobs SET status = 'pending', error_message = ?1, started_at = NULL
                 WHERE status = 'running' AND started_at < ?2 AND attempts < max_attempts",
                params![message, cutoff],
            )
            .context("Failed to reset stuck jobs")?;
        let exhausted = tx
            .execute(
                "UPDATE jobs SET status = 'failed', error_message = ?1, completed_at = ?2
                 WHERE status = 'running' AND started_at < ?3",
                params![message, now, cutoff],
            )
            .context("Failed to fail stuck jobs")?;
        tx.commit().context("Failed to commit reset")?;
        Ok(retried + exhausted)
    }

    /// Delete finished jobs whose `completed_at` is older than `days_old` days.
    pub fn cleanup_jobs_at(&self, days_old: u64, now: i64) -> Result<usize> {
        let cutoff = now - days_old as i64 * 24 * 60 * MINUTE_MS;
        let deleted = self
            .conn
            .execute(
                "DELETE FROM jobs
                 WHERE status IN ('completed', 'failed') AND completed_at < ?1",
                params![cutoff],
            )
            .context("Failed to delete old jobs")?;
        Ok(deleted)
    }

    /// Fail the run's jobs that have not started yet.
    pub fn cancel_jobs_for_run(&self, run_id: i64, reason: &str, now: i64) -> Result<usize> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'failed', error_message = ?1, completed_at = ?2
                 WHERE run_id = ?3 AND status = 'pending'",
                params![reason, now, run_id],
            )
            .context("Failed to cancel run jobs")?;
        Ok(changed)
    }

    /// Queue a job for `opts.run_id` unless that run already has an open job,
    /// in one transaction.
    ///
    /// `finishing` is completed inside the same transaction, so a worker can
    /// hand a run on to its next phase without a window where the run has no
    /// open job or has two.
    pub fn push_run_job(
        &self,
        job_type: JobType,
        payload: &serde_json::Value,
        opts: &PushOptions,
        finishing: Option<i64>,
        now: i64,
    ) -> Result<RunJobPush> {
        let run_id = opts.run_id.context("run job pushed without a run id")?;
        // Safety: see Db::immediate_tx in runs::db.
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin push transaction")?;
        if let Some(id) = finishing {
            self.complete_job(id, now)?;
        }
        if let Some(open) = self.open_job_for_run(run_id)? {
            return Ok(RunJobPush::Busy(open));
        }
        let job = self.push_job(job_type, payload, opts, now)?;
        tx.commit().context("Failed to commit push transaction")?;
        Ok(RunJobPush::Queued(job))
    }

    /// A pending or running job already queued for the run, if any.
    pub fn open_job_for_run(&self, run_id: i64) -> Result<Option<Job>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE run_id = ?1 AND status IN ('pending', 'running')
                     ORDER BY id LIMIT 1"
                ),
                params![run_id],
                read_job_row,
            )
            .optional()
            .context("Failed to query open job")?
            .map(JobRow::into_job)
            .transpose()
    }

    pub fn queue_stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")
            .context("Failed to prepare status counts")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, count) = row.context("Failed to read status count")?;
            stats.total += count;
            stats.by_status.insert(status, count);
        }
        let mut stmt = self
            .conn
            .prepare("SELECT job_type, COUNT(*) FROM jobs GROUP BY job_type")
            .context("Failed to prepare type counts")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (job_type, count) = row.context("Failed to read type count")?;
            stats.by_type.insert(job_type, count);
        }
        Ok(stats)
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        self.conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                read_job_row,
            )
            .optional()
            .context("Failed to query job")?
            .map(JobRow::into_job)
            .transpose()
    }

    /// Most recent jobs first.
    pub fn list_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs ORDER BY id DESC LIMIT ?1"
            ))
            .context("Failed to prepare list_jobs")?;
        let rows = stmt
            .query_map(params![limit as i64], read_job_row)
            .context("Failed to query jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_job()?);
        }
        Ok(jobs)
    }
}

struct JobRow {
    id: i64,
    job_type: String,
    payload: String,
    priority: i64,
    status: String,
    attempts: i64,
    max_attempts: i64,
    run_id: Option<i64>,
    user_id: Option<String>,
    scheduled_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    error_message: Option<String>,
    created_at: i64,
}

fn read_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        job_type: row.get(1)?,
        payload: row.get(2)?,
        priority: row.get(3)?,
        status: row.get(4)?,
        attempts: row.get(5)?,
        max_attempts: row.get(6)?,
        run_id: row.get(7)?,
        user_id: row.get(8)?,
        scheduled_at: row.get(9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
        error_message: row.get(12)?,
        created_at: row.get(13)?,
    })
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id,
            job_type: self.job_type.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            payload: serde_json::from_str(&self.payload).context("invalid job payload in database")?,
            priority: self.priority,
            status: self.status.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            run_id: self.run_id,
            user_id: self.user_id,
            scheduled_at: self.scheduled_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_message: self.error_message,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};

    const T0: i64 = 1_700_000_000_000;

    fn push(db: &Db, job_type: JobType, opts: PushOptions) -> Job {
        db.push_job(job_type, &json!({}), &opts, T0).unwrap()
    }

    #[test]
    fn test_push_defaults() -> Result<()> {
        let db = Db::new_in_memory()?;
        let job = push(&db, JobType::Cleanup, PushOptions::default());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 5);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.scheduled_at, T0);
        assert_eq!(job.created_at, T0);
        Ok(())
    }

    #[test]
    fn test_push_clamps_priority() -> Result<()> {
        let db = Db::new_in_memory()?;
        assert_eq!(push(&db, JobType::Cleanup, PushOptions::default().priority(99)).priority, 10);
        assert_eq!(push(&db, JobType::Cleanup, PushOptions::default().priority(-3)).priority, 0);
        Ok(())
    }

    #[test]
    fn test_pop_orders_by_priority_then_schedule() -> Result<()> {
        let db = Db::new_in_memory()?;
        let low = push(&db, JobType::Cleanup, PushOptions::default().priority(8));
        let later = push(
            &db,
            JobType::Cleanup,
            PushOptions {
                priority: 1,
                scheduled_at: Some(T0 - 10),
                ..Default::default()
            },
        );
        let first = push(
            &db,
            JobType::Cleanup,
            PushOptions {
                priority: 1,
                scheduled_at: Some(T0 - 20),
                ..Default::default()
            },
        );
        let order: Vec<i64> = std::iter::from_fn(|| db.pop_job_at(T0).unwrap())
            .map(|j| j.id)
            .collect();
        assert_eq!(order, vec![first.id, later.id, low.id]);
        Ok(())
    }

    #[test]
    fn test_pop_claims_and_counts_attempt() -> Result<()> {
        let db = Db::new_in_memory()?;
        let job = push(&db, JobType::Plan, PushOptions::default().for_run(1));
        let claimed = db.pop_job_at(T0)?.expect("job should be eligible");
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.started_at, Some(T0));
        assert!(db.pop_job_at(T0)?.is_none());
        Ok(())
    }

    #[test]
    fn test_future_jobs_are_not_eligible() -> Result<()> {
        let db = Db::new_in_memory()?;
        push(
            &db,
            JobType::Cleanup,
            PushOptions {
                scheduled_at: Some(T0 + 1_000),
                ..Default::default()
            },
        );
        assert!(db.pop_job_at(T0)?.is_none());
        assert!(db.pop_job_at(T0 + 1_000)?.is_some());
        Ok(())
    }

    #[test]
    fn test_backoff_two_then_four_minutes_then_exhausted() -> Result<()> {
        let db = Db::new_in_memory()?;
        let job = push(&db, JobType::Plan, PushOptions::default());

        let mut now = T0;
        db.pop_job_at(now)?.unwrap();
        let outcome = db.fail_job(job.id, "boom", now)?.unwrap();
        assert_eq!(outcome, FailOutcome::Retrying { scheduled_at: now + 2 * MINUTE_MS });
        let retried = db.get_job(job.id)?.unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.error_message.as_deref(), Some("boom"));
        assert!(db.pop_job_at(now + MINUTE_MS)?.is_none());

        now += 2 * MINUTE_MS;
        db.pop_job_at(now)?.unwrap();
        let outcome = db.fail_job(job.id, "boom again", now)?.unwrap();
        assert_eq!(outcome, FailOutcome::Retrying { scheduled_at: now + 4 * MINUTE_MS });

        now += 4 * MINUTE_MS;
        let third = db.pop_job_at(now)?.unwrap();
        assert_eq!(third.attempts, 3);
        assert_eq!(db.fail_job(job.id, "final", now)?, Some(FailOutcome::Exhausted));
        let failed = db.get_job(job.id)?.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.completed_at, Some(now));
        assert!(db.pop_job_at(now + 60 * MINUTE_MS)?.is_none());
        Ok(())
    }

    #[test]
    fn test_fail_unknown_job() -> Result<()> {
        let db = Db::new_in_memory()?;
        assert_eq!(db.fail_job(42, "x", T0)?, None);
        assert!(!db.complete_job(42, T0)?);
        Ok(())
    }

    #[test]
    fn test_reset_stuck_keeps_attempts() -> Result<()> {
        let db = Db::new_in_memory()?;
        let job = push(&db, JobType::Plan, PushOptions::default());
        db.pop_job_at(T0)?.unwrap();

        assert_eq!(db.reset_stuck_jobs_at(30, T0 + 10 * MINUTE_MS)?, 0);
        assert_eq!(db.reset_stuck_jobs_at(30, T0 + 31 * MINUTE_MS)?, 1);
        let reset = db.get_job(job.id)?.unwrap();
        assert_eq!(reset.status, JobStatus::Pending);
        assert_eq!(reset.attempts, 1);
        assert_eq!(reset.error_message.as_deref(), Some("timed out after 30 minutes"));
        Ok(())
    }

    #[test]
    fn test_reset_stuck_fails_exhausted_jobs() -> Result<()> {
        let db = Db::new_in_memory()?;
        let job = push(
            &db,
            JobType::Plan,
            PushOptions {
                max_attempts: 1,
                ..Default::default()
            },
        );
        db.pop_job_at(T0)?.unwrap();
        assert_eq!(db.reset_stuck_jobs_at(30, T0 + 31 * MINUTE_MS)?, 1);
        assert_eq!(db.get_job(job.id)?.unwrap().status, JobStatus::Failed);
        Ok(())
    }

    #[test]
    fn test_cleanup_removes_only_old_finished_jobs() -> Result<()> {
        let db = Db::new_in_memory()?;
        let old = push(&db, JobType::Cleanup, PushOptions::default());
        let recent = push(&db, JobType::Cleanup, PushOptions::default());
        let pending = push(&db, JobType::Cleanup, PushOptions::default());
        let day = 24 * 60 * MINUTE_MS;
        db.complete_job(old.id, T0 - 10 * day)?;
        db.fail_job_terminal(recent.id, "x", T0 - day)?;

        assert_eq!(db.cleanup_jobs_at(7, T0)?, 1);
        assert!(db.get_job(old.id)?.is_none());
        assert!(db.get_job(recent.id)?.is_some());
        assert!(db.get_job(pending.id)?.is_some());
        Ok(())
    }

    #[test]
    fn test_cancel_jobs_for_run() -> Result<()> {
        let db = Db::new_in_memory()?;
        let a = push(&db, JobType::Plan, PushOptions::default().for_run(1));
        let other = push(&db, JobType::Plan, PushOptions::default().for_run(2));
        assert_eq!(db.open_job_for_run(1)?.map(|j| j.id), Some(a.id));
        assert_eq!(db.cancel_jobs_for_run(1, "run cancelled", T0)?, 1);
        let cancelled = db.get_job(a.id)?.unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert_eq!(cancelled.error_message.as_deref(), Some("run cancelled"));
        assert!(db.open_job_for_run(1)?.is_none());
        assert_eq!(db.get_job(other.id)?.unwrap().status, JobStatus::Pending);
        Ok(())
    }

    #[test]
    fn test_one_open_job_per_run() -> Result<()> {
        let db = Db::new_in_memory()?;
        let opts = PushOptions::default().for_run(1);
        let first = match db.push_run_job(JobType::Plan, &json!({}), &opts, None, T0)? {
            RunJobPush::Queued(job) => job,
            other => panic!("expected Queued, got {:?}", other),
        };
        match db.push_run_job(JobType::Code, &json!({}), &opts, None, T0)? {
            RunJobPush::Busy(open) => assert_eq!(open.id, first.id),
            other => panic!("expected Busy, got {:?}", other),
        }
        // The index backs the check for writers that skip it.
        assert!(db.push_job(JobType::Code, &json!({}), &opts, T0).is_err());
        assert_eq!(db.queue_stats()?.total, 1);
        Ok(())
    }

    #[test]
    fn test_hand_off_completes_and_queues_together() -> Result<()> {
        let db = Db::new_in_memory()?;
        let opts = PushOptions::default().for_run(1);
        let plan = push(&db, JobType::Plan, opts.clone());
        db.pop_job_at(T0)?;

        let code = match db.push_run_job(JobType::Code, &json!({}), &opts, Some(plan.id), T0)? {
            RunJobPush::Queued(job) => job,
            other => panic!("expected Queued, got {:?}", other),
        };
        assert_eq!(db.get_job(plan.id)?.unwrap().status, JobStatus::Completed);
        assert_eq!(code.status, JobStatus::Pending);
        assert_eq!(db.open_job_for_run(1)?.map(|j| j.id), Some(code.id));
        Ok(())
    }

    #[test]
    fn test_rejected_hand_off_keeps_current_job_open() -> Result<()> {
        let db = Db::new_in_memory()?;
        let plan = push(&db, JobType::Plan, PushOptions::default().for_run(1));
        db.pop_job_at(T0)?;
        // A second open job for the run, written before the index existed.
        db.conn.execute_batch("DROP INDEX idx_jobs_one_open_per_run")?;
        let review = push(&db, JobType::Review, PushOptions::default().for_run(1));

        let opts = PushOptions::default().for_run(1);
        match db.push_run_job(JobType::Code, &json!({}), &opts, Some(plan.id), T0)? {
            RunJobPush::Busy(open) => assert_eq!(open.id, review.id),
            other => panic!("expected Busy, got {:?}", other),
        }
        assert_eq!(db.get_job(plan.id)?.unwrap().status, JobStatus::Running);
        Ok(())
    }

    #[test]
    fn test_stats() -> Result<()> {
        let db = Db::new_in_memory()?;
        push(&db, JobType::Plan, PushOptions::default());
        push(&db, JobType::Plan, PushOptions::default());
        let c = push(&db, JobType::Cleanup, PushOptions::default());
        db.complete_job(c.id, T0)?;
        let stats = db.queue_stats()?;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status.get("pending"), Some(&2));
        assert_eq!(stats.by_status.get("completed"), Some(&1));
        assert_eq!(stats.by_type.get("plan"), Some(&2));
        assert_eq!(stats.by_type.get("cleanup"), Some(&1));
        Ok(())
    }

    #[test]
    fn test_concurrent_pop_claims_each_job_once() -> Result<()> {
        const WORKERS: usize = 6;
        const JOBS: usize = 4;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("queue.db");
        {
            let db = Db::open(&path)?;
            for _ in 0..JOBS {
                push(&db, JobType::Cleanup, PushOptions::default());
            }
        }

        let barrier = Arc::new(Barrier::new(WORKERS));
        let handles: Vec<_> = (0..WORKERS)
            .map(|_| {
                let path = path.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || -> Result<Vec<i64>> {
                    let db = Db::open(&path)?;
                    barrier.wait();
                    let mut claimed = Vec::new();
                    while let Some(job) = db.pop_job_at(T0)? {
                        claimed.push(job.id);
                    }
                    Ok(claimed)
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().expect("worker thread panicked")?);
        }
        let unique: HashSet<i64> = all.iter().copied().collect();
        assert_eq!(all.len(), JOBS);
        assert_eq!(unique.len(), JOBS);
        Ok(())
    }
}
