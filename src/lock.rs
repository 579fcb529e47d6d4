//! Per-repository advisory locks.
//!
//! Apply and rollback hold an exclusive `flock` on
//! `<data_dir>/locks/repo-<id>.lock` so that only one writer touches a
//! repository at a time, across threads and processes.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RepoLocks {
    dir: PathBuf,
    wait: Duration,
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct RepoLockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for RepoLockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %e, "failed to release repo lock");
        }
    }
}

impl RepoLocks {
    pub fn new(dir: impl Into<PathBuf>, wait: Duration) -> Self {
        Self {
            dir: dir.into(),
            wait,
        }
    }

    pub fn lock_path(&self, repo_id: i64) -> PathBuf {
        self.dir.join(format!("repo-{}.lock", repo_id))
    }

    /// Take the lock without waiting. `None` when another holder has it.
    pub fn try_acquire(&self, repo_id: i64) -> Result<Option<RepoLockGuard>> {
        let path = self.lock_path(repo_id);
        try_lock(&path)
    }

    /// Take the lock, polling for up to the configured wait. `None` when it
    /// stayed busy the whole time.
    pub async fn acquire(&self, repo_id: i64) -> Result<Option<RepoLockGuard>> {
        let start = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire(repo_id)? {
                return Ok(Some(guard));
            }
            if start.elapsed() >= self.wait {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn try_lock(path: &Path) -> Result<Option<RepoLockGuard>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create lock directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open lock file {}", path.display()))?;
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => Ok(Some(RepoLockGuard {
            file,
            path: path.to_path_buf(),
        })),
        Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("Failed to acquire lock {}", path.display()))
        }
    }
}
