//! Integration tests for the coderun CLI
//!
//! Each test gets its own working directory so the default `.coderun` data
//! directory never leaks between tests.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a coderun Command rooted in `dir`
fn coderun(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("coderun");
    cmd.current_dir(dir.path())
        .env_remove("CODERUN_DATA_DIR")
        .env_remove("CODERUN_CLAUDE_CMD")
        .env_remove("RUST_LOG");
    cmd
}

fn init_project(dir: &TempDir) {
    coderun(dir).arg("init").assert().success();
}

/// Initialize and register a second temp dir as repo #1.
fn project_with_repo() -> (TempDir, TempDir) {
    let dir = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    init_project(&dir);
    coderun(&dir)
        .args(["repo", "add"])
        .arg(target.path())
        .args(["--name", "target"])
        .assert()
        .success();
    (dir, target)
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_coderun_help() {
        let dir = TempDir::new().unwrap();
        coderun(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("worker"));
    }

    #[test]
    fn test_coderun_version() {
        let dir = TempDir::new().unwrap();
        coderun(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_structure() {
        let dir = TempDir::new().unwrap();

        coderun(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized"));

        assert!(dir.path().join(".coderun/coderun.toml").exists());
        assert!(dir.path().join(".coderun/coderun.db").exists());
        assert!(dir.path().join(".coderun/backups").is_dir());
    }

    #[test]
    fn test_init_keeps_existing_config() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".coderun")).unwrap();
        fs::write(
            dir.path().join(".coderun/coderun.toml"),
            "[worker]\nbudget_secs = 10\n",
        )
        .unwrap();

        coderun(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Keeping existing"));

        let content = fs::read_to_string(dir.path().join(".coderun/coderun.toml")).unwrap();
        assert!(content.contains("budget_secs = 10"));
    }

    #[test]
    fn test_data_dir_flag() {
        let dir = TempDir::new().unwrap();
        coderun(&dir)
            .args(["--data-dir", "elsewhere", "init"])
            .assert()
            .success();
        assert!(dir.path().join("elsewhere/coderun.db").exists());
        assert!(!dir.path().join(".coderun").exists());
    }
}

// =============================================================================
// Config Tests
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_validate_defaults() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        coderun(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_config_validate_warns() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".coderun")).unwrap();
        fs::write(
            dir.path().join(".coderun/coderun.toml"),
            "[queue]\ndefault_priority = 42\n",
        )
        .unwrap();

        coderun(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("default_priority"));
    }

    #[test]
    fn test_config_show() {
        let dir = TempDir::new().unwrap();
        coderun(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[reasoning]"))
            .stdout(predicate::str::contains("using defaults"));
    }

    #[test]
    fn test_invalid_config_fails() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".coderun")).unwrap();
        fs::write(dir.path().join(".coderun/coderun.toml"), "[worker\n").unwrap();

        coderun(&dir)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("coderun.toml"));
    }
}

// =============================================================================
// Repo and Run Tests
// =============================================================================

mod repos_and_runs {
    use super::*;

    #[test]
    fn test_repo_add_and_list() {
        let (dir, _target) = project_with_repo();
        coderun(&dir)
            .args(["repo", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("target"));
    }

    #[test]
    fn test_repo_add_missing_path_fails() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        coderun(&dir)
            .args(["repo", "add", "does/not/exist"])
            .assert()
            .failure();
    }

    #[test]
    fn test_repo_set_flags() {
        let (dir, _target) = project_with_repo();
        coderun(&dir)
            .args(["repo", "set", "1", "--read-only", "true"])
            .assert()
            .success()
            .stdout(predicate::str::contains("ro"));
    }

    #[test]
    fn test_run_create_and_show() {
        let (dir, _target) = project_with_repo();
        coderun(&dir)
            .args(["run", "create", "--repo", "1", "add a hello file"])
            .assert()
            .success()
            .stdout(predicate::str::contains("run #1"));

        coderun(&dir)
            .args(["--json", "run", "show", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"status\": \"pending\""))
            .stdout(predicate::str::contains("add a hello file"));

        coderun(&dir)
            .args(["run", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("pending"));
    }

    #[test]
    fn test_run_for_unknown_repo_fails() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        coderun(&dir)
            .args(["run", "create", "--repo", "9", "anything"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Repo 9 not found"));
    }

    #[test]
    fn test_apply_before_review_is_rejected() {
        let (dir, _target) = project_with_repo();
        coderun(&dir)
            .args(["run", "create", "--repo", "1", "add a file"])
            .assert()
            .success();
        coderun(&dir)
            .args(["run", "apply", "1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Run 1 is pending"));
    }

    #[test]
    fn test_plan_with_missing_reasoning_cli_fails_run() {
        let (dir, _target) = project_with_repo();
        coderun(&dir)
            .args(["run", "create", "--repo", "1", "add a file"])
            .assert()
            .success();

        coderun(&dir)
            .env("CODERUN_CLAUDE_CMD", "coderun-test-no-such-binary")
            .args(["run", "plan", "1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Offline"));

        coderun(&dir)
            .args(["--json", "run", "show", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"status\": \"failed\""))
            .stdout(predicate::str::contains("offline"));
    }

    #[test]
    fn test_cancel_run() {
        let (dir, _target) = project_with_repo();
        coderun(&dir)
            .args(["run", "create", "--repo", "1", "add a file"])
            .assert()
            .success();
        coderun(&dir)
            .args(["run", "cancel", "1", "--reason", "not needed"])
            .assert()
            .success()
            .stdout(predicate::str::contains("failed"));
        coderun(&dir)
            .args(["run", "cancel", "1"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Queue and Worker Tests
// =============================================================================

mod queue {
    use super::*;

    #[test]
    fn test_queue_stats_empty() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        coderun(&dir)
            .args(["queue", "stats"])
            .assert()
            .success()
            .stdout(predicate::str::contains("(0 jobs)"));
    }

    #[test]
    fn test_enqueue_run_and_list() {
        let (dir, _target) = project_with_repo();
        coderun(&dir)
            .args(["run", "create", "--repo", "1", "add a file"])
            .assert()
            .success();
        coderun(&dir)
            .args(["run", "enqueue", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("(plan)"));
        coderun(&dir)
            .args(["run", "enqueue", "1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("already queued"));
        coderun(&dir)
            .args(["queue", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("plan"));
    }

    #[test]
    fn test_maintenance_jobs_drain() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        coderun(&dir)
            .args(["queue", "enqueue-maintenance"])
            .assert()
            .success()
            .stdout(predicate::str::contains("cleanup"));
        coderun(&dir)
            .args(["worker", "--budget", "30"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Processed 2 job(s)"));
        coderun(&dir)
            .args(["--json", "queue", "stats"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"completed\": 2"));
    }

    #[test]
    fn test_worker_budget_conflicts_with_serve() {
        let dir = TempDir::new().unwrap();
        coderun(&dir)
            .args(["worker", "--budget", "5", "--serve"])
            .assert()
            .failure();
    }
}
