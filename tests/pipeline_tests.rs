//! End-to-end run pipeline tests against real directories and git repos,
//! with a scripted reasoning service standing in for the CLI.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use coderun::config::{CoderunConfig, CoderunToml};
use coderun::db::{Db, DbHandle};
use coderun::phases::{FileContents, Reasoned, ReasoningService, RepoContext};
use coderun::queue::{JobStatus, JobWorker, WorkerSettings};
use coderun::runs::RunStatus;
use coderun::runs::models::{PlanArtifact, ReviewResult, RiskLevel, Usage};
use coderun::{RunError, RunService, ServiceError};
use tempfile::TempDir;

// =============================================================================
// Scripted reasoning service
// =============================================================================

struct Scripted {
    diff: String,
    approve: bool,
    /// Make every plan call fail as if the service were offline.
    plan_offline: bool,
    plan_delay: Duration,
    plans: AtomicUsize,
    reviews: AtomicUsize,
}

impl Scripted {
    fn build(diff: &str) -> Self {
        Self {
            diff: diff.to_string(),
            approve: true,
            plan_offline: false,
            plan_delay: Duration::ZERO,
            plans: AtomicUsize::new(0),
            reviews: AtomicUsize::new(0),
        }
    }

    fn new(diff: &str) -> Arc<Self> {
        Arc::new(Self::build(diff))
    }
}

#[async_trait]
impl ReasoningService for Scripted {
    async fn plan(
        &self,
        request: &str,
        _: &RepoContext,
    ) -> Result<Reasoned<PlanArtifact>, ServiceError> {
        self.plans.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.plan_delay).await;
        if self.plan_offline {
            return Err(ServiceError::offline("scripted outage"));
        }
        Ok(Reasoned::new(
            PlanArtifact {
                summary: format!("Plan for: {}", request),
                steps: vec!["edit the file".to_string()],
                files: vec![],
                extra: Default::default(),
            },
            Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
        ))
    }

    async fn generate_code(
        &self,
        _: &PlanArtifact,
        _: &RepoContext,
        _: &FileContents,
    ) -> Result<Reasoned<String>, ServiceError> {
        Ok(Reasoned::new(self.diff.clone(), Usage::default()))
    }

    async fn review(
        &self,
        _: &str,
        _: &PlanArtifact,
        _: &RepoContext,
    ) -> Result<Reasoned<ReviewResult>, ServiceError> {
        self.reviews.fetch_add(1, Ordering::SeqCst);
        Ok(Reasoned::new(
            ReviewResult {
                safe_to_apply: self.approve,
                risk_level: RiskLevel::Low,
                issues: vec![],
                summary: "looks fine".to_string(),
                source: Default::default(),
            },
            Usage::default(),
        ))
    }
}

// =============================================================================
// Fixtures
// =============================================================================

const CREATE_A: &str = "\
--- /dev/null
+++ b/a.txt
@@ -0,0 +1 @@
+hello
";

const MODIFY_X: &str = "\
--- a/x.txt
+++ b/x.txt
@@ -1 +1 @@
-original
+changed
";

fn service(data: &TempDir, reasoner: Arc<dyn ReasoningService>) -> RunService {
    let config = CoderunConfig {
        data_dir: data.path().to_path_buf(),
        toml: CoderunToml::default(),
        verbose: false,
    };
    let db = DbHandle::new(Db::new_in_memory().unwrap());
    RunService::with_db(db, &config, reasoner).unwrap()
}

/// A git repo with `x.txt` committed.
fn git_repo() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let repo = git2::Repository::init(dir.path()).unwrap();
    std::fs::write(dir.path().join("x.txt"), "original\n").unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new("x.txt")).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = git2::Signature::now("test", "test@example.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
        .unwrap();
    dir
}

async fn drive_to_ready(service: &RunService, run_id: i64) {
    service.plan(run_id).await.unwrap();
    service.code(run_id).await.unwrap();
    let run = service.review(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Ready);
}

// =============================================================================
// Pipeline
// =============================================================================

#[tokio::test]
async fn test_create_file_end_to_end() {
    let data = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let service = service(&data, Scripted::new(CREATE_A));

    let repo = service.register_repo("plain", target.path(), vec![]).await.unwrap();
    let run = service.create_run(repo.id, "add a.txt", None, None).await.unwrap();
    assert_eq!(run.status, RunStatus::Pending);

    drive_to_ready(&service, run.id).await;
    let run = service.apply(run.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let content = std::fs::read_to_string(target.path().join("a.txt")).unwrap();
    assert_eq!(content.trim_end(), "hello");
    // Not a git repo: no checkpoints, apply still succeeds.
    assert!(run.git_checkpoint.is_none());
    assert!(run.applied_commit.is_none());
    assert!(run.apply_report.unwrap().success);

    let steps = service.run_steps(run.id).await.unwrap();
    assert_eq!(steps.len(), 4);
    assert_eq!(steps[0].usage.input_tokens, 10);
}

#[tokio::test]
async fn test_apply_and_rollback_in_git_repo() {
    let data = tempfile::tempdir().unwrap();
    let target = git_repo();
    let service = service(&data, Scripted::new(MODIFY_X));

    let repo = service.register_repo("git", target.path(), vec![]).await.unwrap();
    let run = service.create_run(repo.id, "change x", None, None).await.unwrap();
    drive_to_ready(&service, run.id).await;

    let applied = service.apply(run.id).await.unwrap();
    assert_eq!(applied.status, RunStatus::Completed);
    assert!(applied.git_checkpoint.is_some());
    assert!(applied.applied_commit.is_some());
    assert_ne!(applied.git_checkpoint, applied.applied_commit);
    let x = target.path().join("x.txt");
    assert_eq!(std::fs::read_to_string(&x).unwrap(), "changed\n");

    let rolled = service.rollback(run.id).await.unwrap();
    assert_eq!(rolled.status, RunStatus::RolledBack);
    assert_eq!(std::fs::read_to_string(&x).unwrap(), "original\n");

    // Rolled back is terminal for rollback too.
    assert!(service.rollback(run.id).await.is_err());
}

#[tokio::test]
async fn test_failed_apply_restores_checkpoint_and_can_roll_back() {
    let data = tempfile::tempdir().unwrap();
    let target = git_repo();
    let service = service(&data, Scripted::new(MODIFY_X));

    let repo = service.register_repo("git", target.path(), vec![]).await.unwrap();
    let run = service.create_run(repo.id, "change x", None, None).await.unwrap();
    drive_to_ready(&service, run.id).await;

    // The file drifted after review, so the hunk no longer matches.
    let x = target.path().join("x.txt");
    std::fs::write(&x, "edited by hand\n").unwrap();
    std::fs::write(target.path().join("notes.txt"), "scratch\n").unwrap();

    let err = service.apply(run.id).await.unwrap_err();
    assert!(matches!(err, RunError::ApplyFailed { .. }), "got {err:?}");
    let failed = service.get_run(run.id).await.unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert!(failed.error_message.unwrap().starts_with("apply failed"));
    let report = failed.apply_report.expect("report is kept");
    assert!(!report.success);

    // The worktree sits exactly on the pre-apply checkpoint.
    let checkpoint = failed.git_checkpoint.expect("checkpoint recorded");
    let git = git2::Repository::open(target.path()).unwrap();
    let head = git.head().unwrap().peel_to_commit().unwrap().id().to_string();
    assert_eq!(head, checkpoint);
    assert!(git.statuses(None).unwrap().is_empty());
    assert_eq!(std::fs::read_to_string(&x).unwrap(), "edited by hand\n");

    let rolled = service.rollback(run.id).await.unwrap();
    assert_eq!(rolled.status, RunStatus::RolledBack);
    assert_eq!(std::fs::read_to_string(&x).unwrap(), "edited by hand\n");
    assert!(target.path().join("notes.txt").exists());
}

#[tokio::test]
async fn test_failed_rollback_keeps_status() {
    let data = tempfile::tempdir().unwrap();
    let target = git_repo();
    let service = service(&data, Scripted::new(MODIFY_X));

    let repo = service.register_repo("git", target.path(), vec![]).await.unwrap();
    let run = service.create_run(repo.id, "change x", None, None).await.unwrap();
    drive_to_ready(&service, run.id).await;
    service.apply(run.id).await.unwrap();

    // Point the run at a commit the repository does not have.
    let run_id = run.id;
    service
        .db()
        .call(move |db| db.set_git_checkpoint(run_id, "1111111111111111111111111111111111111111"))
        .await
        .unwrap();

    let err = service.rollback(run.id).await.unwrap_err();
    assert!(matches!(err, RunError::RollbackFailed { .. }), "got {err:?}");
    let run = service.get_run(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.error_message.unwrap().starts_with("rollback failed"));
    let x = target.path().join("x.txt");
    assert_eq!(std::fs::read_to_string(&x).unwrap(), "changed\n");
}

#[tokio::test]
async fn test_concurrent_plan_calls_reason_once() {
    let data = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let reasoner = Arc::new(Scripted {
        plan_delay: Duration::from_millis(300),
        ..Scripted::build(CREATE_A)
    });
    let service = service(&data, reasoner.clone());

    let repo = service.register_repo("twice", target.path(), vec![]).await.unwrap();
    let run = service.create_run(repo.id, "add a.txt", None, None).await.unwrap();

    let (first, second) = tokio::join!(service.plan(run.id), service.plan(run.id));
    let (won, lost) = match (first, second) {
        (Ok(run), Err(err)) | (Err(err), Ok(run)) => (run, err),
        other => panic!("expected one success and one conflict, got {other:?}"),
    };
    assert!(matches!(lost, RunError::Conflict { .. }), "got {lost:?}");
    assert!(won.plan_artifact.is_some());
    assert_eq!(reasoner.plans.load(Ordering::SeqCst), 1);

    let steps = service.run_steps(run.id).await.unwrap();
    assert_eq!(steps.len(), 1);
}

#[tokio::test]
async fn test_read_only_repo_rejects_apply() {
    let data = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let service = service(&data, Scripted::new(CREATE_A));

    let repo = service.register_repo("ro", target.path(), vec![]).await.unwrap();
    let run = service.create_run(repo.id, "add a.txt", None, None).await.unwrap();
    drive_to_ready(&service, run.id).await;
    service.set_repo_flags(repo.id, Some(true), None).await.unwrap();

    let err = service.apply(run.id).await.unwrap_err();
    assert!(matches!(err, RunError::RepoPolicy { .. }), "got {err:?}");
    let run = service.get_run(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Ready);
    assert!(!target.path().join("a.txt").exists());
}

#[tokio::test]
async fn test_blocked_path_skips_model_review() {
    let data = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let diff = "\
--- /dev/null
+++ b/.env
@@ -0,0 +1 @@
+DEBUG=1
";
    let reasoner = Scripted::new(diff);
    let service = service(&data, reasoner.clone());

    let repo = service.register_repo("env", target.path(), vec![]).await.unwrap();
    let run = service.create_run(repo.id, "add env", None, None).await.unwrap();
    service.plan(run.id).await.unwrap();
    service.code(run.id).await.unwrap();
    let run = service.review(run.id).await.unwrap();

    assert_eq!(reasoner.reviews.load(Ordering::SeqCst), 0);
    assert_eq!(run.status, RunStatus::Failed);
    let review = run.review_result.unwrap();
    assert!(!review.safe_to_apply);
    assert_eq!(review.risk_level, RiskLevel::Critical);
    assert!(!review.issues.is_empty());
}

#[tokio::test]
async fn test_rejected_review_fails_run() {
    let data = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let reasoner = Arc::new(Scripted {
        approve: false,
        ..Scripted::build(CREATE_A)
    });
    let service = service(&data, reasoner.clone());

    let repo = service.register_repo("r", target.path(), vec![]).await.unwrap();
    let run = service.create_run(repo.id, "add a.txt", None, None).await.unwrap();
    service.plan(run.id).await.unwrap();
    service.code(run.id).await.unwrap();
    let run = service.review(run.id).await.unwrap();

    assert_eq!(reasoner.reviews.load(Ordering::SeqCst), 1);
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error_message.unwrap().contains("review rejected"));
    assert!(service.apply(run.id).await.is_err());
}

#[tokio::test]
async fn test_parent_escape_never_touches_disk() {
    let data = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let diff = "\
--- /dev/null
+++ b/../../etc/passwd
@@ -0,0 +1 @@
+root::0:0::/:/bin/sh
";
    let service = service(&data, Scripted::new(diff));

    let repo = service.register_repo("esc", target.path(), vec![]).await.unwrap();
    let run = service.create_run(repo.id, "escape", None, None).await.unwrap();
    service.plan(run.id).await.unwrap();
    service.code(run.id).await.unwrap();
    let reviewed = service.review(run.id).await.unwrap();
    if reviewed.status == RunStatus::Ready {
        assert!(service.apply(run.id).await.is_err());
    }

    let run = service.get_run(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(std::fs::read_dir(target.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_allowed_prefixes_restrict_writes() {
    let data = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let service = service(&data, Scripted::new(CREATE_A));

    let repo = service
        .register_repo("scoped", target.path(), vec!["src/".to_string()])
        .await
        .unwrap();
    let run = service.create_run(repo.id, "add a.txt", None, None).await.unwrap();
    drive_to_ready(&service, run.id).await;

    assert!(service.apply(run.id).await.is_err());
    let run = service.get_run(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(!target.path().join("a.txt").exists());
}

#[tokio::test]
async fn test_phase_out_of_order_is_conflict() {
    let data = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let service = service(&data, Scripted::new(CREATE_A));

    let repo = service.register_repo("order", target.path(), vec![]).await.unwrap();
    let run = service.create_run(repo.id, "add a.txt", None, None).await.unwrap();

    let err = service.apply(run.id).await.unwrap_err();
    assert!(matches!(err, RunError::Conflict { .. }), "got {err:?}");
    let err = service.code(run.id).await.unwrap_err();
    assert!(matches!(err, RunError::Conflict { .. }), "got {err:?}");
    assert_eq!(
        service.get_run(run.id).await.unwrap().status,
        RunStatus::Pending
    );
}

#[tokio::test]
async fn test_cancel_before_apply() {
    let data = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let service = service(&data, Scripted::new(CREATE_A));

    let repo = service.register_repo("c", target.path(), vec![]).await.unwrap();
    let run = service.create_run(repo.id, "add a.txt", None, None).await.unwrap();
    service.plan(run.id).await.unwrap();

    let cancelled = service.cancel(run.id, "changed my mind").await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Failed);
    assert!(cancelled.error_message.unwrap().contains("changed my mind"));
    assert!(service.code(run.id).await.is_err());
}

// =============================================================================
// Worker
// =============================================================================

#[tokio::test]
async fn test_worker_drives_run_to_completion() {
    let data = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let service = service(&data, Scripted::new(CREATE_A));

    let repo = service.register_repo("queued", target.path(), vec![]).await.unwrap();
    let run = service.create_run(repo.id, "add a.txt", None, None).await.unwrap();
    let job = service.enqueue(run.id).await.unwrap();
    assert_eq!(job.run_id, Some(run.id));
    // One open job per run.
    assert!(service.enqueue(run.id).await.is_err());

    let worker = JobWorker::new(service.clone(), WorkerSettings::default());
    let summary = worker.drain(Duration::from_secs(30)).await.unwrap();

    assert_eq!(summary.processed, 4);
    assert_eq!(summary.failed, 0);
    let run = service.get_run(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(target.path().join("a.txt").exists());

    let stats = service.queue_stats().await.unwrap();
    assert_eq!(stats.by_status.get("completed"), Some(&4));
    assert_eq!(stats.total, 4);
}

#[tokio::test]
async fn test_failing_phase_job_backs_off_and_fails_run() {
    let data = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let reasoner = Arc::new(Scripted {
        plan_offline: true,
        ..Scripted::build(CREATE_A)
    });
    let service = service(&data, reasoner.clone());

    let repo = service.register_repo("down", target.path(), vec![]).await.unwrap();
    let run = service.create_run(repo.id, "add a.txt", None, None).await.unwrap();
    let job = service.enqueue(run.id).await.unwrap();

    let worker = JobWorker::new(service.clone(), WorkerSettings::default());
    let summary = worker.drain(Duration::from_secs(30)).await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(reasoner.plans.load(Ordering::SeqCst), 1);

    let run = service.get_run(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    // The job is waiting out its backoff, not claimable yet.
    let retried = service.queue().get(job.id).await.unwrap();
    assert_eq!(retried.status, JobStatus::Pending);
    assert_eq!(retried.attempts, 1);
    assert!(retried.scheduled_at > retried.created_at);
    assert!(retried.error_message.is_some());
    assert!(service.queue().pop().await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_drops_queued_job() {
    let data = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let service = service(&data, Scripted::new(CREATE_A));

    let repo = service.register_repo("c", target.path(), vec![]).await.unwrap();
    let run = service.create_run(repo.id, "add a.txt", None, None).await.unwrap();
    let job = service.enqueue(run.id).await.unwrap();

    service.cancel(run.id, "not needed").await.unwrap();
    let job = service.queue().get(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("run cancelled"));
    assert!(service.queue().pop().await.unwrap().is_none());
}
