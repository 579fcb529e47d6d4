//! Plan, code, review, apply and rollback, each recorded as a run step.
//!
//! Every executor follows the same shape: re-read the run, atomically enter
//! the phase (`Db::begin_phase`), do the work, then either finish the phase
//! with a compare-and-swap on the entered status or record the failure. No
//! path leaves the step `running`.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use super::context::{RepoContext, read_files};
use super::reasoning::{Reasoned, ReasoningService};
use crate::apply::{AppliedChanges, ApplyReport, BackupStore, DiffApplier, diff};
use crate::checkpoint::{Checkpoint, GitCheckpoint};
use crate::db::DbHandle;
use crate::errors::{RunError, ServiceError};
use crate::lock::{RepoLockGuard, RepoLocks};
use crate::runs::db::BeginPhase;
use crate::runs::models::{Phase, Repo, Run, RunStatus, RunUpdate, Usage};
use crate::runs::state::check_phase_guard;
use crate::safety::SafetyGate;

/// Limits applied while talking to the reasoning service.
#[derive(Debug, Clone)]
pub struct PhaseSettings {
    pub reasoning_timeout: Duration,
    pub max_file_bytes: u64,
    pub max_listing: usize,
    /// Age after which a step still `running` is taken to be abandoned.
    pub stale_step_minutes: u64,
}

impl Default for PhaseSettings {
    fn default() -> Self {
        Self {
            reasoning_timeout: Duration::from_secs(300),
            max_file_bytes: 200_000,
            max_listing: 500,
            stale_step_minutes: 30,
        }
    }
}

/// Successful phase result, written with `Db::finish_phase`.
struct Finished {
    update: RunUpdate,
    output: Option<Value>,
    usage: Usage,
}

/// Failed phase result, written with `Db::fail_phase`.
struct Failure {
    error: RunError,
    message: String,
    output: Option<Value>,
    /// Status to move the run to; `None` keeps it.
    status: Option<RunStatus>,
}

impl Failure {
    fn new(error: RunError) -> Self {
        Self {
            message: error.to_string(),
            error,
            output: None,
            status: Some(RunStatus::Failed),
        }
    }

    fn service(error: ServiceError) -> Self {
        Self {
            message: error.user_message(),
            error: RunError::Reasoning(error),
            output: None,
            status: Some(RunStatus::Failed),
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

impl From<RunError> for Failure {
    fn from(error: RunError) -> Self {
        Self::new(error)
    }
}

#[derive(Clone)]
pub struct PhaseExecutors {
    db: DbHandle,
    reasoner: Arc<dyn ReasoningService>,
    safety: Arc<SafetyGate>,
    backups: BackupStore,
    checkpoint: GitCheckpoint,
    locks: RepoLocks,
    settings: PhaseSettings,
}

impl PhaseExecutors {
    pub fn new(
        db: DbHandle,
        reasoner: Arc<dyn ReasoningService>,
        safety: SafetyGate,
        backups: BackupStore,
        checkpoint: GitCheckpoint,
        locks: RepoLocks,
        settings: PhaseSettings,
    ) -> Self {
        Self {
            db,
            reasoner,
            safety: Arc::new(safety),
            backups,
            checkpoint,
            locks,
            settings,
        }
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    pub async fn execute(&self, run_id: i64, phase: Phase) -> Result<Run, RunError> {
        match phase {
            Phase::Plan => self.plan(run_id).await,
            Phase::Code => self.code(run_id).await,
            Phase::Review => self.review(run_id).await,
            Phase::Apply => self.apply(run_id).await,
            Phase::Rollback => self.rollback(run_id).await,
        }
    }

    // ── Phases ────────────────────────────────────────────────────────

    #[instrument(skip(self), fields(phase = "plan"))]
    pub async fn plan(&self, run_id: i64) -> Result<Run, RunError> {
        let (_, repo) = self.prepare(run_id, Phase::Plan).await?;
        self.run_phase(run_id, Phase::Plan, |run| self.plan_body(run, repo))
            .await
    }

    async fn plan_body(&self, run: Run, repo: Repo) -> Result<Finished, Failure> {
        let context = self.context(repo, &run.request_text).await?;
        let Reasoned { value: plan, usage } = self
            .reason(self.reasoner.plan(&run.request_text, &context))
            .await
            .map_err(Failure::service)?;
        info!(run_id = run.id, files = plan.files.len(), "plan stored");
        Ok(Finished {
            output: serde_json::to_value(&plan).ok(),
            update: RunUpdate {
                plan_artifact: Some(plan),
                ..Default::default()
            },
            usage,
        })
    }

    #[instrument(skip(self), fields(phase = "code"))]
    pub async fn code(&self, run_id: i64) -> Result<Run, RunError> {
        let (_, repo) = self.prepare(run_id, Phase::Code).await?;
        self.run_phase(run_id, Phase::Code, |run| self.code_body(run, repo))
            .await
    }

    async fn code_body(&self, run: Run, repo: Repo) -> Result<Finished, Failure> {
        let Some(plan) = run.plan_artifact.clone() else {
            return Err(RunError::conflict(run.id, run.status, "code requires a stored plan").into());
        };
        let base = PathBuf::from(&repo.base_path);
        let paths = plan.files.clone();
        let max_bytes = self.settings.max_file_bytes;
        let files = blocking(move || read_files(&base, &paths, max_bytes)).await?;
        let context = self.context(repo, &run.request_text).await?;

        let Reasoned { value: diff_text, usage } = self
            .reason(self.reasoner.generate_code(&plan, &context, &files))
            .await
            .map_err(Failure::service)?;
        let patches = diff::parse(&diff_text).map_err(|e| {
            Failure::service(ServiceError::invalid_response(format!(
                "generated diff is malformed: {}",
                e
            )))
        })?;
        let touched: Vec<&str> = patches.iter().map(|p| p.path()).collect();
        info!(run_id = run.id, files = touched.len(), "diff stored");
        Ok(Finished {
            output: Some(json!({ "files": touched, "bytes": diff_text.len() })),
            update: RunUpdate {
                diff_content: Some(diff_text.clone()),
                ..Default::default()
            },
            usage,
        })
    }

    /// Run the safety gate and, only if it passes, the reasoning review.
    ///
    /// A rejected diff is a normal outcome: the run ends `failed` and `Ok` is
    /// returned.
    #[instrument(skip(self), fields(phase = "review"))]
    pub async fn review(&self, run_id: i64) -> Result<Run, RunError> {
        let (_, repo) = self.prepare(run_id, Phase::Review).await?;
        self.run_phase(run_id, Phase::Review, |run| self.review_body(run, repo))
            .await
    }

    async fn review_body(&self, run: Run, repo: Repo) -> Result<Finished, Failure> {
        let (Some(diff_text), Some(plan)) = (run.diff_content.clone(), run.plan_artifact.clone())
        else {
            return Err(
                RunError::conflict(run.id, run.status, "review requires a plan and a diff").into(),
            );
        };

        let report = self.safety.check(&diff_text);
        let (review, usage) = if report.passed() {
            let context = self.context(repo, &run.request_text).await?;
            let Reasoned { value, usage } = self
                .reason(self.reasoner.review(&diff_text, &plan, &context))
                .await
                .map_err(Failure::service)?;
            (value, usage)
        } else {
            warn!(
                run_id = run.id,
                issues = report.issues.len(),
                "safety gate rejected diff"
            );
            (report.to_review(), Usage::default())
        };

        let (status, error_message) = if review.safe_to_apply {
            (RunStatus::Ready, None)
        } else {
            (
                RunStatus::Failed,
                Some(format!("review rejected diff (risk: {})", review.risk_level)),
            )
        };
        info!(run_id = run.id, safe = review.safe_to_apply, risk = %review.risk_level, "review stored");
        Ok(Finished {
            output: serde_json::to_value(&review).ok(),
            update: RunUpdate {
                status: Some(status),
                review_result: Some(review),
                error_message,
                ..Default::default()
            },
            usage,
        })
    }

    /// Apply the reviewed diff between two git checkpoints under the repo lock.
    #[instrument(skip(self), fields(phase = "apply"))]
    pub async fn apply(&self, run_id: i64) -> Result<Run, RunError> {
        let (_, repo) = self.prepare(run_id, Phase::Apply).await?;
        let _lock = self.lock(repo.id).await?;
        self.run_phase(run_id, Phase::Apply, |run| self.apply_body(run, repo))
            .await
    }

    async fn apply_body(&self, run: Run, repo: Repo) -> Result<Finished, Failure> {
        let run_id = run.id;
        let Some(diff_text) = run.diff_content.clone() else {
            return Err(RunError::conflict(run_id, run.status, "apply requires stored diff content").into());
        };
        let base = PathBuf::from(&repo.base_path);

        let pre = self
            .snapshot(base.clone(), format!("coderun: checkpoint before run {}", run_id))
            .await
            .map_err(|e| {
                let message = match &e {
                    RunError::Checkpoint(inner) => format!("pre-apply checkpoint failed: {}", inner),
                    other => format!("pre-apply checkpoint failed: {}", other),
                };
                Failure::new(e).with_message(message)
            })?;
        if let Some(commit) = pre.commit.clone() {
            self.db
                .call(move |db| db.set_git_checkpoint(run_id, &commit))
                .await
                .map_err(RunError::Database)?;
        }

        let policy = repo.policy();
        let backups = self.backups.clone();
        let applied = blocking(move || DiffApplier::new(&policy, &backups).apply(&diff_text)).await?;
        let outcome = match applied {
            Ok(outcome) => outcome,
            Err(e) => {
                let failure = Failure::new(RunError::ApplyFailed {
                    run_id,
                    message: e.to_string(),
                })
                .with_message(format!("apply failed: {}", e));
                let restored = self.restore(base, pre.commit, None).await?;
                return Err(escalate(run_id, failure, restored));
            }
        };

        if !outcome.report.success {
            let report = outcome.report;
            let detail = report
                .first_error()
                .unwrap_or_else(|| "no file could be applied".to_string());
            let restored = self.restore(base, pre.commit, None).await?;
            self.keep_report(run_id, &report).await;
            let failure = Failure {
                message: format!("apply failed: {}", detail),
                error: RunError::ApplyFailed {
                    run_id,
                    message: detail,
                },
                output: serde_json::to_value(&report).ok(),
                status: Some(RunStatus::Failed),
            };
            return Err(escalate(run_id, failure, restored));
        }

        let report = outcome.report;
        let post = self
            .snapshot(base.clone(), format!("coderun: apply run {}", run_id))
            .await;
        let post = match post {
            Ok(post) => post,
            Err(e) => {
                warn!(run_id, error = %e, "post-apply checkpoint failed, restoring");
                let restored = self.restore(base, pre.commit, Some(outcome.changes)).await?;
                self.keep_report(run_id, &report).await;
                let message = if restored.is_ok() {
                    "post-apply checkpoint failed, changes were reverted"
                } else {
                    "post-apply checkpoint failed"
                };
                let failure = Failure::new(e).with_message(message);
                return Err(escalate(run_id, failure, restored));
            }
        };

        info!(
            run_id,
            files = report.files.len(),
            commit = post.commit.as_deref().unwrap_or("-"),
            "diff applied"
        );
        Ok(Finished {
            output: serde_json::to_value(&report).ok(),
            update: RunUpdate {
                status: Some(RunStatus::Completed),
                applied_commit: post.commit,
                apply_report: Some(report),
                ..Default::default()
            },
            usage: Usage::default(),
        })
    }

    /// Hard-reset the repository to the run's pre-apply checkpoint.
    ///
    /// On failure the run keeps its status and `RollbackFailed` is returned.
    #[instrument(skip(self), fields(phase = "rollback"))]
    pub async fn rollback(&self, run_id: i64) -> Result<Run, RunError> {
        let (_, repo) = self.prepare(run_id, Phase::Rollback).await?;
        let _lock = self.lock(repo.id).await?;
        self.run_phase(run_id, Phase::Rollback, |run| self.rollback_body(run, repo))
            .await
    }

    async fn rollback_body(&self, run: Run, repo: Repo) -> Result<Finished, Failure> {
        let run_id = run.id;
        let Some(commit) = run.git_checkpoint.clone() else {
            return Err(RunError::conflict(run_id, run.status, "rollback requires a git checkpoint").into());
        };
        let base = PathBuf::from(&repo.base_path);
        let checkpoint = self.checkpoint.clone();
        let target = commit.clone();
        let restored = blocking(move || checkpoint.rollback(&base, &target)).await?;
        if let Err(e) = restored {
            return Err(Failure {
                message: format!("rollback failed: {}", e),
                error: RunError::RollbackFailed {
                    run_id,
                    message: e.to_string(),
                },
                output: None,
                status: None,
            });
        }
        info!(run_id, commit = %commit, "repository rolled back");
        Ok(Finished {
            output: Some(json!({ "restored": commit })),
            update: RunUpdate {
                status: Some(RunStatus::RolledBack),
                ..Default::default()
            },
            usage: Usage::default(),
        })
    }

    // ── Plumbing ──────────────────────────────────────────────────────

    /// Load the run and its repo and check the phase guard (and, for writes,
    /// the repo policy) before anything is locked or mutated.
    async fn prepare(&self, run_id: i64, phase: Phase) -> Result<(Run, Repo), RunError> {
        let (run, repo) = self
            .db
            .call(move |db| {
                let Some(run) = db.get_run(run_id)? else {
                    return Ok(None);
                };
                let repo = db.get_repo(run.repo_id)?;
                Ok(Some((run, repo)))
            })
            .await
            .map_err(RunError::Database)?
            .ok_or(RunError::RunNotFound { id: run_id })?;
        let repo = repo.ok_or(RunError::RepoNotFound { id: run.repo_id })?;

        check_phase_guard(phase, &run).map_err(|reason| RunError::conflict(run_id, run.status, reason))?;
        if matches!(phase, Phase::Apply | Phase::Rollback)
            && let Some(reason) = repo.policy().write_block_reason()
        {
            return Err(RunError::RepoPolicy {
                repo_id: repo.id,
                reason: reason.to_string(),
            });
        }
        Ok((run, repo))
    }

    async fn lock(&self, repo_id: i64) -> Result<RepoLockGuard, RunError> {
        self.locks
            .acquire(repo_id)
            .await
            .map_err(RunError::Other)?
            .ok_or(RunError::RepoBusy { repo_id })
    }

    /// Enter `phase`, run `body`, then record its outcome.
    async fn run_phase<F, Fut>(&self, run_id: i64, phase: Phase, body: F) -> Result<Run, RunError>
    where
        F: FnOnce(Run) -> Fut,
        Fut: Future<Output = Result<Finished, Failure>>,
    {
        let stale_minutes = self.settings.stale_step_minutes;
        let outcome = self
            .db
            .call(move |db| db.begin_phase(run_id, phase, stale_minutes))
            .await
            .map_err(RunError::Database)?;
        let (run, step) = match outcome {
            BeginPhase::Started { run, step } => (run, step),
            BeginPhase::Rejected { status, reason } => {
                return Err(RunError::conflict(run_id, status, reason));
            }
            BeginPhase::PolicyBlocked { repo_id, reason } => {
                return Err(RunError::RepoPolicy { repo_id, reason });
            }
            BeginPhase::NotFound => return Err(RunError::RunNotFound { id: run_id }),
        };
        info!(run_id, step_id = step.id, %phase, "phase started");
        let expected = run.status;
        let step_id = step.id;

        match body(run).await {
            Ok(Finished {
                update,
                output,
                usage,
            }) => {
                let finished = self
                    .db
                    .call(move |db| {
                        db.finish_phase(run_id, step_id, expected, &update, output.as_ref(), usage)
                    })
                    .await
                    .map_err(RunError::Database)?;
                match finished {
                    Some(run) => {
                        info!(run_id, %phase, status = %run.status, "phase finished");
                        Ok(run)
                    }
                    None => {
                        let status = self.current_status(run_id).await?;
                        warn!(run_id, %phase, %status, "run changed while the phase was running");
                        Err(RunError::conflict(
                            run_id,
                            status,
                            "run changed status while the phase was running",
                        ))
                    }
                }
            }
            Err(Failure {
                error,
                message,
                output,
                status,
            }) => {
                warn!(run_id, %phase, error = %message, "phase failed");
                self.db
                    .call(move |db| db.fail_phase(run_id, step_id, &message, output.as_ref(), status))
                    .await
                    .map_err(RunError::Database)?;
                Err(error)
            }
        }
    }

    async fn current_status(&self, run_id: i64) -> Result<RunStatus, RunError> {
        self.db
            .call(move |db| db.get_run(run_id))
            .await
            .map_err(RunError::Database)?
            .map(|run| run.status)
            .ok_or(RunError::RunNotFound { id: run_id })
    }

    async fn context(&self, repo: Repo, request_text: &str) -> Result<RepoContext, RunError> {
        let request_text = request_text.to_string();
        let max_listing = self.settings.max_listing;
        blocking(move || RepoContext::build(&repo, &request_text, max_listing)).await
    }

    async fn reason<T>(
        &self,
        call: impl Future<Output = Result<Reasoned<T>, ServiceError>>,
    ) -> Result<Reasoned<T>, ServiceError> {
        let limit = self.settings.reasoning_timeout;
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::timeout(format!(
                "no response after {}s",
                limit.as_secs()
            ))),
        }
    }

    async fn snapshot(&self, base: PathBuf, label: String) -> Result<Checkpoint, RunError> {
        let checkpoint = self.checkpoint.clone();
        blocking(move || checkpoint.create_checkpoint(&base, &label))
            .await?
            .map_err(RunError::Checkpoint)
    }

    /// Store the report of a failed apply. The failure itself is what the
    /// caller reports, so a storage error is only logged.
    async fn keep_report(&self, run_id: i64, report: &ApplyReport) {
        let report = report.clone();
        if let Err(e) = self
            .db
            .call(move |db| db.set_apply_report(run_id, &report))
            .await
        {
            warn!(run_id, error = %e, "failed to store apply report");
        }
    }

    /// Undo a failed apply: revert the journal (if any), then hard-reset to
    /// the pre-apply checkpoint when the repo had one.
    async fn restore(
        &self,
        base: PathBuf,
        pre_commit: Option<String>,
        changes: Option<AppliedChanges>,
    ) -> Result<Result<(), String>, RunError> {
        let checkpoint = self.checkpoint.clone();
        blocking(move || -> Result<(), String> {
            if let Some(changes) = changes {
                changes.revert().map_err(|e| e.to_string())?;
            }
            if let Some(commit) = pre_commit {
                checkpoint.rollback(&base, &commit).map_err(|e| e.to_string())?;
            }
            Ok(())
        })
        .await
    }
}

/// Replace `failure` with `RollbackFailed` when restoring the repository
/// after it did not work.
fn escalate(run_id: i64, failure: Failure, restored: Result<(), String>) -> Failure {
    match restored {
        Ok(()) => failure,
        Err(restore_error) => {
            warn!(run_id, error = %restore_error, "restoring the pre-apply checkpoint failed");
            Failure {
                message: format!(
                    "{} and restoring the repository failed: {}",
                    failure.message, restore_error
                ),
                error: RunError::RollbackFailed {
                    run_id,
                    message: restore_error,
                },
                ..failure
            }
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, RunError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RunError::Other(anyhow::anyhow!("blocking task failed: {}", e)))
}
