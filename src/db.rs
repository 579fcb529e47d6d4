use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Async-safe handle to the coderun database.
///
/// Wraps `Db` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Db>>,
}

impl DbHandle {
    pub fn new(db: Db) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Db) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Used at startup, in the CLI
    /// and in tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Db>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// SQLite storage for repos, runs, run steps and jobs.
///
/// Several processes may open the same file; WAL journaling plus a busy
/// timeout lets concurrent workers wait for each other's write locks instead
/// of failing.
pub struct Db {
    pub(crate) conn: Connection,
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

impl Db {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        // journal_mode returns a row, so it cannot go through execute_batch.
        let _mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .context("Failed to enable WAL journaling")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS repos (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    base_path TEXT NOT NULL UNIQUE,
                    read_only INTEGER NOT NULL DEFAULT 0,
                    maintenance_locked INTEGER NOT NULL DEFAULT 0,
                    allowed_path_prefixes TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repo_id INTEGER NOT NULL REFERENCES repos(id),
                    user_id TEXT,
                    thread_id TEXT,
                    request_text TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    plan_artifact TEXT,
                    diff_content TEXT,
                    review_result TEXT,
                    git_checkpoint TEXT,
                    applied_commit TEXT,
                    apply_report TEXT,
                    error_message TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS run_steps (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id),
                    phase TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'running',
                    output_artifact TEXT,
                    error_message TEXT,
                    input_tokens INTEGER NOT NULL DEFAULT 0,
                    output_tokens INTEGER NOT NULL DEFAULT 0,
                    started_at TEXT NOT NULL DEFAULT (datetime('now')),
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_type TEXT NOT NULL,
                    payload TEXT NOT NULL DEFAULT '{}',
                    priority INTEGER NOT NULL DEFAULT 5,
                    status TEXT NOT NULL DEFAULT 'pending',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    max_attempts INTEGER NOT NULL DEFAULT 3,
                    run_id INTEGER,
                    user_id TEXT,
                    scheduled_at INTEGER NOT NULL,
                    started_at INTEGER,
                    completed_at INTEGER,
                    error_message TEXT,
                    created_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_runs_repo ON runs(repo_id);
                CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
                CREATE INDEX IF NOT EXISTS idx_run_steps_run ON run_steps(run_id);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_run_steps_one_running
                    ON run_steps(run_id) WHERE status = 'running';
                CREATE INDEX IF NOT EXISTS idx_jobs_claim
                    ON jobs(status, priority, scheduled_at);
                CREATE INDEX IF NOT EXISTS idx_jobs_run ON jobs(run_id);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_one_open_per_run
                    ON jobs(run_id) WHERE status IN ('pending', 'running');
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }
}

/// Current time as epoch milliseconds, the unit used for job timestamps.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
