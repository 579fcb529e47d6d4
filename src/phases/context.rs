//! Repository context handed to the reasoning service.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tracing::debug;
use walkdir::WalkDir;

use super::reasoning::FileContents;
use crate::runs::models::Repo;

const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules"];

/// What the reasoning service gets to know about a repository.
#[derive(Debug, Clone, Serialize)]
pub struct RepoContext {
    pub repo_id: i64,
    pub name: String,
    pub base_path: PathBuf,
    pub request_text: String,
    /// Sorted repository-relative file paths, at most `max_listing` of them.
    pub files: Vec<String>,
    /// True when the listing was cut off at `max_listing`.
    pub truncated: bool,
}

impl RepoContext {
    /// Build the context for `repo`, listing up to `max_listing` files.
    pub fn build(repo: &Repo, request_text: &str, max_listing: usize) -> Self {
        let base_path = PathBuf::from(&repo.base_path);
        let (files, truncated) = list_files(&base_path, max_listing);
        Self {
            repo_id: repo.id,
            name: repo.name.clone(),
            base_path,
            request_text: request_text.to_string(),
            files,
            truncated,
        }
    }

    /// Render the listing as prompt text.
    pub fn listing(&self) -> String {
        let mut out = self.files.join("\n");
        if self.truncated {
            out.push_str("\n... (listing truncated)");
        }
        out
    }
}

fn list_files(base: &Path, max_listing: usize) -> (Vec<String>, bool) {
    let mut files: Vec<String> = WalkDir::new(base)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir()
                    && SKIPPED_DIRS.contains(&e.file_name().to_string_lossy().as_ref()))
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(base)
                .ok()
                .map(|rel| rel.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    files.sort();
    let truncated = files.len() > max_listing;
    files.truncate(max_listing);
    (files, truncated)
}

/// Read the current contents of `paths` under `base`.
///
/// Paths that are absolute, climb out of `base`, are missing, are larger than
/// `max_bytes` or are not UTF-8 are left out of the result.
pub fn read_files(base: &Path, paths: &[String], max_bytes: u64) -> FileContents {
    let canonical_base = match base.canonicalize() {
        Ok(p) => p,
        Err(_) => return FileContents::new(),
    };
    let mut contents = FileContents::new();
    for rel in paths {
        let relative = Path::new(rel);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            debug!(path = %rel, "skipping path outside the repository");
            continue;
        }
        let Ok(full) = canonical_base.join(relative).canonicalize() else {
            continue;
        };
        if !full.starts_with(&canonical_base) {
            debug!(path = %rel, "skipping path that resolves outside the repository");
            continue;
        }
        let Ok(meta) = std::fs::metadata(&full) else {
            continue;
        };
        if !meta.is_file() || meta.len() > max_bytes {
            continue;
        }
        if let Ok(text) = std::fs::read_to_string(&full) {
            contents.insert(rel.clone(), text);
        }
    }
    contents
}
