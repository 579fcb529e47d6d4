use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};

use super::models::*;
use super::state::{check_phase_guard, is_cancellable, is_valid_transition, phase_entry};
use crate::db::Db;

const RUN_COLUMNS: &str = "id, repo_id, user_id, thread_id, request_text, status, plan_artifact, \
     diff_content, review_result, git_checkpoint, applied_commit, apply_report, error_message, \
     created_at, updated_at, completed_at";

const STEP_COLUMNS: &str = "id, run_id, phase, status, output_artifact, error_message, \
     input_tokens, output_tokens, started_at, completed_at";

const REPO_COLUMNS: &str =
    "id, name, base_path, read_only, maintenance_locked, allowed_path_prefixes, created_at";

/// Outcome of trying to start a phase.
#[derive(Debug)]
pub enum BeginPhase {
    Started { run: Run, step: RunStep },
    /// The phase guard rejected the run; nothing was written.
    Rejected { status: RunStatus, reason: String },
    /// The repo policy forbids writes; nothing was written.
    PolicyBlocked { repo_id: i64, reason: String },
    NotFound,
}

/// Outcome of a cancellation request.
#[derive(Debug)]
pub enum CancelOutcome {
    /// `dropped_jobs` pending jobs of the run were failed with it.
    Cancelled { run: Run, dropped_jobs: usize },
    Rejected(RunStatus),
    NotFound,
}

impl Db {
    fn immediate_tx(&self) -> Result<Transaction<'_>> {
        // Safety: the connection is only reachable through DbHandle's mutex or
        // a single-threaded owner, so no other transaction is open on it.
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin transaction")
    }

    // ── Repos ─────────────────────────────────────────────────────────

    pub fn register_repo(
        &self,
        name: &str,
        base_path: &str,
        allowed_path_prefixes: &[String],
    ) -> Result<Repo> {
        let prefixes = serde_json::to_string(allowed_path_prefixes)?;
        self.conn
            .execute(
                "INSERT INTO repos (name, base_path, allowed_path_prefixes) VALUES (?1, ?2, ?3)",
                params![name, base_path, prefixes],
            )
            .context("Failed to insert repo")?;
        let id = self.conn.last_insert_rowid();
        self.get_repo(id)?.context("Repo not found after insert")
    }

    pub fn get_repo(&self, id: i64) -> Result<Option<Repo>> {
        query_repo(&self.conn, id)
    }

    pub fn list_repos(&self) -> Result<Vec<Repo>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {REPO_COLUMNS} FROM repos ORDER BY id"))
            .context("Failed to prepare list_repos")?;
        let rows = stmt
            .query_map([], read_repo_row)
            .context("Failed to query repos")?;
        let mut repos = Vec::new();
        for row in rows {
            repos.push(row.context("Failed to read repo row")?.into_repo()?);
        }
        Ok(repos)
    }

    pub fn set_repo_flags(
        &self,
        id: i64,
        read_only: Option<bool>,
        maintenance_locked: Option<bool>,
    ) -> Result<Repo> {
        self.conn
            .execute(
                "UPDATE repos SET
                    read_only = COALESCE(?1, read_only),
                    maintenance_locked = COALESCE(?2, maintenance_locked)
                 WHERE id = ?3",
                params![read_only, maintenance_locked, id],
            )
            .context("Failed to update repo flags")?;
        self.get_repo(id)?.context("Repo not found after flag update")
    }

    // ── Runs ──────────────────────────────────────────────────────────

    pub fn create_run(
        &self,
        repo_id: i64,
        request_text: &str,
        user_id: Option<&str>,
        thread_id: Option<&str>,
    ) -> Result<Run> {
        self.conn
            .execute(
                "INSERT INTO runs (repo_id, request_text, user_id, thread_id) VALUES (?1, ?2, ?3, ?4)",
                params![repo_id, request_text, user_id, thread_id],
            )
            .context("Failed to insert run")?;
        let id = self.conn.last_insert_rowid();
        self.get_run(id)?.context("Run not found after insert")
    }

    pub fn get_run(&self, id: i64) -> Result<Option<Run>> {
        query_run(&self.conn, id)
    }

    pub fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs ORDER BY id DESC LIMIT ?1"
            ))
            .context("Failed to prepare list_runs")?;
        let rows = stmt
            .query_map(params![limit as i64], read_run_row)
            .context("Failed to query runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read run row")?.into_run()?);
        }
        Ok(runs)
    }

    pub fn get_run_detail(&self, id: i64) -> Result<Option<RunDetail>> {
        let Some(run) = self.get_run(id)? else {
            return Ok(None);
        };
        let steps = self.list_steps(id)?;
        Ok(Some(RunDetail { run, steps }))
    }

    /// Check the phase guard and, if it holds, move the run into the phase's
    /// status and open a `running` step, all in one transaction.
    ///
    /// Rollback keeps the run's status until it succeeds.
    ///
    /// A step still `running` is only taken over once it is older than
    /// `stale_minutes`; a fresher one means the phase is live elsewhere and
    /// the call is rejected.
    pub fn begin_phase(&self, run_id: i64, phase: Phase, stale_minutes: u64) -> Result<BeginPhase> {
        let tx = self.immediate_tx()?;
        let Some(run) = query_run(&tx, run_id)? else {
            return Ok(BeginPhase::NotFound);
        };
        if let Err(reason) = check_phase_guard(phase, &run) {
            return Ok(BeginPhase::Rejected {
                status: run.status,
                reason,
            });
        }
        if matches!(phase, Phase::Apply | Phase::Rollback) {
            let repo = query_repo(&tx, run.repo_id)?
                .with_context(|| format!("Repo {} not found for run {}", run.repo_id, run_id))?;
            if let Some(reason) = repo.policy().write_block_reason() {
                return Ok(BeginPhase::PolicyBlocked {
                    repo_id: repo.id,
                    reason: reason.to_string(),
                });
            }
        }

        let cutoff = format!("-{} minutes", stale_minutes);
        let live: Option<String> = tx
            .query_row(
                "SELECT phase FROM run_steps
                 WHERE run_id = ?1 AND status = 'running' AND started_at > datetime('now', ?2)",
                params![run_id, cutoff],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to check for a live step")?;
        if let Some(live) = live {
            return Ok(BeginPhase::Rejected {
                status: run.status,
                reason: format!("{} is already running for this run", live),
            });
        }

        // A stale running step belongs to a worker that died mid-phase.
        tx.execute(
            "UPDATE run_steps SET status = 'failed', error_message = 'interrupted before completion',
                completed_at = datetime('now')
             WHERE run_id = ?1 AND status = 'running'",
            params![run_id],
        )
        .context("Failed to close interrupted steps")?;

        if phase != Phase::Rollback {
            let (entered, _) = phase_entry(phase);
            tx.execute(
                "UPDATE runs SET status = ?1, error_message = NULL, updated_at = datetime('now')
                 WHERE id = ?2",
                params![entered.as_str(), run_id],
            )
            .context("Failed to move run into phase")?;
        }

        tx.execute(
            "INSERT INTO run_steps (run_id, phase, status) VALUES (?1, ?2, 'running')",
            params![run_id, phase.as_str()],
        )
        .context("Failed to insert run step")?;
        let step_id = tx.last_insert_rowid();

        let run = query_run(&tx, run_id)?.context("Run vanished during begin_phase")?;
        let step = query_step(&tx, step_id)?.context("Step not found after insert")?;
        tx.commit().context("Failed to commit begin_phase")?;
        Ok(BeginPhase::Started { run, step })
    }

    /// Record the git checkpoint taken before an apply mutates anything.
    pub fn set_git_checkpoint(&self, run_id: i64, commit: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET git_checkpoint = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![commit, run_id],
            )
            .context("Failed to store git checkpoint")?;
        Ok(())
    }

    /// Store the report of an apply that did not succeed.
    pub fn set_apply_report(&self, run_id: i64, report: &crate::apply::ApplyReport) -> Result<()> {
        let report = serde_json::to_string(report)?;
        self.conn
            .execute(
                "UPDATE runs SET apply_report = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![report, run_id],
            )
            .context("Failed to store apply report")?;
        Ok(())
    }

    /// Close a phase successfully.
    ///
    /// The run is only updated while it is still in `expected` status. If it
    /// moved on (e.g. it was cancelled mid-phase) the step is closed as failed
    /// and `None` is returned.
    pub fn finish_phase(
        &self,
        run_id: i64,
        step_id: i64,
        expected: RunStatus,
        update: &RunUpdate,
        output: Option<&serde_json::Value>,
        usage: Usage,
    ) -> Result<Option<Run>> {
        if let Some(next) = update.status
            && next != expected
            && !is_valid_transition(expected, next)
        {
            anyhow::bail!("run {} cannot move from {} to {}", run_id, expected, next);
        }
        let tx = self.immediate_tx()?;
        let terminal = update.status.is_some_and(|s| s.is_terminal());
        let changed = tx
            .execute(
                "UPDATE runs SET
                    status = COALESCE(?1, status),
                    plan_artifact = COALESCE(?2, plan_artifact),
                    diff_content = COALESCE(?3, diff_content),
                    review_result = COALESCE(?4, review_result),
                    applied_commit = COALESCE(?5, applied_commit),
                    apply_report = COALESCE(?6, apply_report),
                    error_message = COALESCE(?7, error_message),
                    updated_at = datetime('now'),
                    completed_at = CASE WHEN ?8 THEN datetime('now') ELSE completed_at END
                 WHERE id = ?9 AND status = ?10",
                params![
                    update.status.map(|s| s.as_str()),
                    to_json(update.plan_artifact.as_ref())?,
                    update.diff_content,
                    to_json(update.review_result.as_ref())?,
                    update.applied_commit,
                    to_json(update.apply_report.as_ref())?,
                    update.error_message,
                    terminal,
                    run_id,
                    expected.as_str(),
                ],
            )
            .context("Failed to update run")?;

        let output = output.map(serde_json::to_string).transpose()?;
        if changed == 0 {
            tx.execute(
                "UPDATE run_steps SET status = 'failed', output_artifact = ?1,
                    error_message = 'run changed status while the phase was running',
                    input_tokens = ?2, output_tokens = ?3, completed_at = datetime('now')
                 WHERE id = ?4 AND status = 'running'",
                params![output, usage.input_tokens as i64, usage.output_tokens as i64, step_id],
            )
            .context("Failed to close superseded step")?;
            tx.commit().context("Failed to commit finish_phase")?;
            return Ok(None);
        }

        tx.execute(
            "UPDATE run_steps SET status = 'completed', output_artifact = ?1,
                input_tokens = ?2, output_tokens = ?3, completed_at = datetime('now')
             WHERE id = ?4 AND status = 'running'",
            params![output, usage.input_tokens as i64, usage.output_tokens as i64, step_id],
        )
        .context("Failed to complete run step")?;
        let run = query_run(&tx, run_id)?.context("Run vanished during finish_phase")?;
        tx.commit().context("Failed to commit finish_phase")?;
        Ok(Some(run))
    }

    /// Close a phase as failed and record the message on the run.
    ///
    /// `run_status` is the status to move the run to (`Failed` for phase
    /// errors); `None` keeps the status and only records the message. A run
    /// that is already terminal keeps its status either way.
    pub fn fail_phase(
        &self,
        run_id: i64,
        step_id: i64,
        message: &str,
        output: Option<&serde_json::Value>,
        run_status: Option<RunStatus>,
    ) -> Result<Run> {
        let tx = self.immediate_tx()?;
        let current = query_run(&tx, run_id)?.context("Run vanished during fail_phase")?;
        if let Some(status) = run_status
            && !current.status.is_terminal()
            && !is_valid_transition(current.status, status)
        {
            anyhow::bail!("run {} cannot move from {} to {}", run_id, current.status, status);
        }
        let output = output.map(serde_json::to_string).transpose()?;
        tx.execute(
            "UPDATE run_steps SET status = 'failed', output_artifact = ?1, error_message = ?2,
                completed_at = datetime('now')
             WHERE id = ?3 AND status = 'running'",
            params![output, message, step_id],
        )
        .context("Failed to fail run step")?;
        match run_status {
            // A run that is already terminal keeps its status.
            Some(_) if current.status.is_terminal() => {}
            Some(status) => {
                tx.execute(
                    "UPDATE runs SET status = ?1, error_message = ?2, updated_at = datetime('now'),
                        completed_at = datetime('now')
                     WHERE id = ?3",
                    params![status.as_str(), message, run_id],
                )
                .context("Failed to mark run failed")?;
            }
            None => {
                tx.execute(
                    "UPDATE runs SET error_message = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![message, run_id],
                )
                .context("Failed to record run error")?;
            }
        }
        let run = query_run(&tx, run_id)?.context("Run vanished during fail_phase")?;
        tx.commit().context("Failed to commit fail_phase")?;
        Ok(run)
    }

    /// Cancel a run that has not started applying, failing its pending jobs
    /// in the same transaction.
    pub fn cancel_run(&self, run_id: i64, reason: &str) -> Result<CancelOutcome> {
        let tx = self.immediate_tx()?;
        let Some(run) = query_run(&tx, run_id)? else {
            return Ok(CancelOutcome::NotFound);
        };
        if !is_cancellable(run.status) {
            return Ok(CancelOutcome::Rejected(run.status));
        }
        let message = format!("cancelled: {}", reason);
        tx.execute(
            "UPDATE runs SET status = 'failed', error_message = ?1, updated_at = datetime('now'),
                completed_at = datetime('now')
             WHERE id = ?2",
            params![message, run_id],
        )
        .context("Failed to cancel run")?;
        tx.execute(
            "UPDATE run_steps SET status = 'failed', error_message = ?1, completed_at = datetime('now')
             WHERE run_id = ?2 AND status = 'running'",
            params![message, run_id],
        )
        .context("Failed to close running step")?;
        let dropped_jobs = self.cancel_jobs_for_run(run_id, "run cancelled", crate::db::now_ms())?;
        let run = query_run(&tx, run_id)?.context("Run vanished during cancel")?;
        tx.commit().context("Failed to commit cancel")?;
        Ok(CancelOutcome::Cancelled { run, dropped_jobs })
    }

    // ── Run steps ─────────────────────────────────────────────────────

    pub fn list_steps(&self, run_id: i64) -> Result<Vec<RunStep>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM run_steps WHERE run_id = ?1 ORDER BY id"
            ))
            .context("Failed to prepare list_steps")?;
        let rows = stmt
            .query_map(params![run_id], read_step_row)
            .context("Failed to query run steps")?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(row.context("Failed to read step row")?.into_step()?);
        }
        Ok(steps)
    }
}

fn to_json<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value
        .map(serde_json::to_string)
        .transpose()
        .context("Failed to serialize run field")
}

fn from_json<T: serde::de::DeserializeOwned>(value: Option<String>, field: &str) -> Result<Option<T>> {
    value
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .with_context(|| format!("invalid {} in database", field))
}

fn query_run(conn: &Connection, id: i64) -> Result<Option<Run>> {
    conn.query_row(
        &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
        params![id],
        read_run_row,
    )
    .optional()
    .context("Failed to query run")?
    .map(RunRow::into_run)
    .transpose()
}

fn query_step(conn: &Connection, id: i64) -> Result<Option<RunStep>> {
    conn.query_row(
        &format!("SELECT {STEP_COLUMNS} FROM run_steps WHERE id = ?1"),
        params![id],
        read_step_row,
    )
    .optional()
    .context("Failed to query run step")?
    .map(StepRow::into_step)
    .transpose()
}

fn query_repo(conn: &Connection, id: i64) -> Result<Option<Repo>> {
    conn.query_row(
        &format!("SELECT {REPO_COLUMNS} FROM repos WHERE id = ?1"),
        params![id],
        read_repo_row,
    )
    .optional()
    .context("Failed to query repo")?
    .map(RepoRow::into_repo)
    .transpose()
}

// ── Row types ─────────────────────────────────────────────────────────

struct RepoRow {
    id: i64,
    name: String,
    base_path: String,
    read_only: bool,
    maintenance_locked: bool,
    allowed_path_prefixes: String,
    created_at: String,
}

fn read_repo_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RepoRow> {
    Ok(RepoRow {
        id: row.get(0)?,
        name: row.get(1)?,
        base_path: row.get(2)?,
        read_only: row.get(3)?,
        maintenance_locked: row.get(4)?,
        allowed_path_prefixes: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl RepoRow {
    fn into_repo(self) -> Result<Repo> {
        let allowed_path_prefixes: Vec<String> = serde_json::from_str(&self.allowed_path_prefixes)
            .context("invalid allowed_path_prefixes in database")?;
        Ok(Repo {
            id: self.id,
            name: self.name,
            base_path: self.base_path,
            read_only: self.read_only,
            maintenance_locked: self.maintenance_locked,
            allowed_path_prefixes,
            created_at: self.created_at,
        })
    }
}

struct RunRow {
    id: i64,
    repo_id: i64,
    user_id: Option<String>,
    thread_id: Option<String>,
    request_text: String,
    status: String,
    plan_artifact: Option<String>,
    diff_content: Option<String>,
    review_result: Option<String>,
    git_checkpoint: Option<String>,
    applied_commit: Option<String>,
    apply_report: Option<String>,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

fn read_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        id: row.get(0)?,
        repo_id: row.get(1)?,
        user_id: row.get(2)?,
        thread_id: row.get(3)?,
        request_text: row.get(4)?,
        status: row.get(5)?,
        plan_artifact: row.get(6)?,
        diff_content: row.get(7)?,
        review_result: row.get(8)?,
        git_checkpoint: row.get(9)?,
        applied_commit: row.get(10)?,
        apply_report: row.get(11)?,
        error_message: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
        completed_at: row.get(15)?,
    })
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        Ok(Run {
            id: self.id,
            repo_id: self.repo_id,
            user_id: self.user_id,
            thread_id: self.thread_id,
            request_text: self.request_text,
            status: self
                .status
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?,
            plan_artifact: from_json(self.plan_artifact, "plan_artifact")?,
            diff_content: self.diff_content,
            review_result: from_json(self.review_result, "review_result")?,
            git_checkpoint: self.git_checkpoint,
            applied_commit: self.applied_commit,
            apply_report: from_json(self.apply_report, "apply_report")?,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}

struct StepRow {
    id: i64,
    run_id: i64,
    phase: String,
    status: String,
    output_artifact: Option<String>,
    error_message: Option<String>,
    input_tokens: i64,
    output_tokens: i64,
    started_at: String,
    completed_at: Option<String>,
}

fn read_step_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StepRow> {
    Ok(StepRow {
        id: row.get(0)?,
        run_id: row.get(1)?,
        phase: row.get(2)?,
        status: row.get(3)?,
        output_artifact: row.get(4)?,
        error_message: row.get(5)?,
        input_tokens: row.get(6)?,
        output_tokens: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
    })
}

impl StepRow {
    fn into_step(self) -> Result<RunStep> {
        Ok(RunStep {
            id: self.id,
            run_id: self.run_id,
            phase: self.phase.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            status: self.status.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            output_artifact: from_json(self.output_artifact, "output_artifact")?,
            error_message: self.error_message,
            usage: Usage {
                input_tokens: self.input_tokens.max(0) as u64,
                output_tokens: self.output_tokens.max(0) as u64,
            },
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}
