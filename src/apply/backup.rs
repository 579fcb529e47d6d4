//! Timestamped copies of files overwritten or deleted by an apply.
//!
//! Layout: `<root>/repo-<id>/<YYYYMMDDTHHMMSSmmmZ>-<suffix>/<relative path>`
//! with a `manifest.json` listing the saved paths.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

const MANIFEST: &str = "manifest.json";
const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub repo_id: i64,
    pub created_at: String,
    pub files: Vec<String>,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a backup set for one apply call. Nothing is created on disk
    /// until the first file is saved.
    pub fn begin(&self, repo_id: i64) -> BackupSet {
        let now = Utc::now();
        let name = format!(
            "{}-{}-{}",
            now.format("%Y%m%dT%H%M%S%3fZ"),
            std::process::id(),
            SEQUENCE.fetch_add(1, Ordering::Relaxed)
        );
        BackupSet {
            dir: self.root.join(format!("repo-{}", repo_id)).join(name),
            manifest: BackupManifest {
                repo_id,
                created_at: now.to_rfc3339(),
                files: Vec::new(),
            },
        }
    }

    /// Remove backup sets older than `retention`. Returns how many were removed.
    ///
    /// Directories whose names do not start with a backup timestamp are left alone.
    pub fn cleanup(&self, retention: Duration) -> Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let cutoff = Utc::now().naive_utc()
            - chrono::Duration::from_std(retention).context("Retention window too large")?;
        let mut removed = 0;

        for repo_dir in std::fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read {}", self.root.display()))?
        {
            let repo_dir = repo_dir?;
            if !repo_dir.file_type()?.is_dir()
                || !repo_dir.file_name().to_string_lossy().starts_with("repo-")
            {
                continue;
            }
            for set in std::fs::read_dir(repo_dir.path())? {
                let set = set?;
                let name = set.file_name().to_string_lossy().to_string();
                let Some(stamp) = name.get(..15) else {
                    continue;
                };
                let Ok(created) = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT) else {
                    continue;
                };
                if created < cutoff {
                    std::fs::remove_dir_all(set.path()).with_context(|| {
                        format!("Failed to remove backup {}", set.path().display())
                    })?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// The backup directory of one apply call.
#[derive(Debug)]
pub struct BackupSet {
    dir: PathBuf,
    manifest: BackupManifest,
}

impl BackupSet {
    /// The directory, if anything has been saved into it.
    pub fn dir(&self) -> Option<&Path> {
        (!self.manifest.files.is_empty()).then_some(self.dir.as_path())
    }

    /// Copy `source` to `<dir>/<rel>` and record it in the manifest.
    ///
    /// A path is saved once per set; later calls keep the first copy.
    pub fn save(&mut self, rel: &str, source: &Path) -> std::io::Result<PathBuf> {
        let target = self.dir.join(rel);
        if self.manifest.files.iter().any(|f| f == rel) {
            return Ok(target);
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source, &target)?;
        self.manifest.files.push(rel.to_string());
        let manifest = serde_json::to_vec_pretty(&self.manifest)?;
        std::fs::write(self.dir.join(MANIFEST), manifest)?;
        Ok(target)
    }
}
