//! All-or-nothing application of a unified diff to a directory tree.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::backup::BackupStore;
use super::diff::{self, ChangeKind, FilePatch, Hunk, LineKind, normalize};
use crate::errors::DiffError;
use crate::runs::models::RepoPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Applied,
    Failed,
    Skipped,
    Reverted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileResult {
    pub path: String,
    pub change: ChangeKind,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub success: bool,
    pub files: Vec<FileResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<PathBuf>,
}

impl ApplyReport {
    /// First per-file error, for run error messages.
    pub fn first_error(&self) -> Option<String> {
        self.files
            .iter()
            .find_map(|f| f.error.as_ref().map(|e| format!("{}: {}", f.path, e)))
    }
}

/// Result of [`DiffApplier::apply`].
#[derive(Debug)]
pub struct ApplyOutcome {
    pub report: ApplyReport,
    /// Journal of what was written; empty unless `report.success`.
    pub changes: AppliedChanges,
}

/// What one successful apply wrote, so it can be undone.
#[derive(Debug, Default)]
pub struct AppliedChanges {
    entries: Vec<JournalEntry>,
}

#[derive(Debug)]
struct JournalEntry {
    target: PathBuf,
    /// Copy of the original content; `None` when the file was created.
    backup: Option<PathBuf>,
    created_dirs: Vec<PathBuf>,
}

impl AppliedChanges {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Put every touched file back the way it was, newest first.
    pub fn revert(&self) -> Result<(), DiffError> {
        for entry in self.entries.iter().rev() {
            revert_entry(entry)?;
        }
        Ok(())
    }
}

fn revert_entry(entry: &JournalEntry) -> Result<(), DiffError> {
    match &entry.backup {
        Some(backup) => {
            let content = std::fs::read(backup).map_err(|source| DiffError::Io {
                path: backup.clone(),
                source,
            })?;
            let mode = std::fs::metadata(backup).ok().map(|m| m.permissions());
            write_atomic(&entry.target, &content, mode)?;
        }
        None => match std::fs::remove_file(&entry.target) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(DiffError::Io {
                    path: entry.target.clone(),
                    source,
                });
            }
        },
    }
    for dir in entry.created_dirs.iter().rev() {
        // Only empty directories go; anything else someone else put there.
        let _ = std::fs::remove_dir(dir);
    }
    Ok(())
}

/// What a file will become once the batch is written.
#[derive(Debug)]
enum Planned {
    Write(Vec<u8>),
    Remove,
    /// Pure creation of content that is already there.
    Unchanged,
}

#[derive(Debug)]
struct PlannedFile {
    rel: String,
    target: PathBuf,
    change: ChangeKind,
    exists: bool,
    action: Planned,
}

/// Applies diffs inside one repository under its [`RepoPolicy`].
pub struct DiffApplier<'a> {
    policy: &'a RepoPolicy,
    backups: &'a BackupStore,
}

impl<'a> DiffApplier<'a> {
    pub fn new(policy: &'a RepoPolicy, backups: &'a BackupStore) -> Self {
        Self { policy, backups }
    }

    /// Apply `diff_text` to the policy's base directory.
    ///
    /// Parse errors and path rejections return `Err` before anything is
    /// touched. Per-file problems are reported in an `ApplyReport` with
    /// `success = false`; in that case the tree is left as it was.
    pub fn apply(&self, diff_text: &str) -> Result<ApplyOutcome, DiffError> {
        let patches = diff::parse(diff_text)?;
        let base = self
            .policy
            .base_path
            .canonicalize()
            .map_err(|source| DiffError::Io {
                path: self.policy.base_path.clone(),
                source,
            })?;

        let mut targets = Vec::with_capacity(patches.len());
        for patch in &patches {
            for path in patch.touched_paths() {
                check_path(&base, &self.policy.allowed_path_prefixes, path)?;
            }
            let rel = normalize(patch.path());
            targets.push((base.join(&rel), rel));
        }

        // Compute every new content before writing anything.
        let mut planned = Vec::with_capacity(patches.len());
        let mut failures: Vec<(usize, String)> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for (idx, (patch, (target, rel))) in patches.iter().zip(targets).enumerate() {
            // Every section is planned against the file on disk, so a second
            // section for the same path would silently drop the first.
            let plan = if seen.insert(rel.clone()) {
                plan_file(patch, &target)
            } else {
                Err("path appears in more than one section of the diff".to_string())
            };
            match plan {
                Ok((exists, action)) => planned.push(PlannedFile {
                    rel,
                    target,
                    change: patch.kind,
                    exists,
                    action,
                }),
                Err(message) => {
                    debug!(path = %rel, error = %message, "diff does not apply");
                    failures.push((idx, message));
                    planned.push(PlannedFile {
                        rel,
                        target,
                        change: patch.kind,
                        exists: false,
                        action: Planned::Unchanged,
                    });
                }
            }
        }

        if !failures.is_empty() {
            let files = planned
                .iter()
                .enumerate()
                .map(|(idx, file)| {
                    let error = failures
                        .iter()
                        .find(|(i, _)| *i == idx)
                        .map(|(_, e)| e.clone());
                    FileResult {
                        path: file.rel.clone(),
                        change: file.change,
                        status: if error.is_some() {
                            FileStatus::Failed
                        } else {
                            FileStatus::Skipped
                        },
                        error,
                    }
                })
                .collect();
            return Ok(ApplyOutcome {
                report: ApplyReport {
                    success: false,
                    files,
                    backup_dir: None,
                },
                changes: AppliedChanges::default(),
            });
        }

        self.write_all(planned)
    }

    fn write_all(&self, planned: Vec<PlannedFile>) -> Result<ApplyOutcome, DiffError> {
        let mut backup = self.backups.begin(self.policy.repo_id);
        let mut journal = AppliedChanges::default();
        // Index into `results` of each journal entry.
        let mut written: Vec<usize> = Vec::new();
        let mut results: Vec<FileResult> = Vec::with_capacity(planned.len());
        let mut failed = false;

        for file in &planned {
            let mut result = FileResult {
                path: file.rel.clone(),
                change: file.change,
                status: FileStatus::Applied,
                error: None,
            };
            if failed {
                result.status = FileStatus::Skipped;
            } else {
                match write_file(file, &mut backup) {
                    Ok(Some(entry)) => {
                        written.push(results.len());
                        journal.entries.push(entry);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(path = %file.rel, error = %e, "write failed, reverting batch");
                        failed = true;
                        result.status = FileStatus::Failed;
                        result.error = Some(e.to_string());
                    }
                }
            }
            results.push(result);
        }

        let backup_dir = backup.dir().map(Path::to_path_buf);
        if !failed {
            return Ok(ApplyOutcome {
                report: ApplyReport {
                    success: true,
                    files: results,
                    backup_dir,
                },
                changes: journal,
            });
        }

        for (entry, idx) in journal.entries.iter().zip(&written).rev() {
            revert_entry(entry)?;
            results[*idx].status = FileStatus::Reverted;
        }
        // Idempotent creations wrote nothing and need no revert.
        for result in results.iter_mut() {
            if result.status == FileStatus::Applied {
                result.status = FileStatus::Skipped;
            }
        }
        Ok(ApplyOutcome {
            report: ApplyReport {
                success: false,
                files: results,
                backup_dir,
            },
            changes: AppliedChanges::default(),
        })
    }
}

/// Back up and write one file. Returns the journal entry, or `None` when
/// nothing had to be written.
fn write_file(
    file: &PlannedFile,
    backup: &mut super::backup::BackupSet,
) -> Result<Option<JournalEntry>, DiffError> {
    let io_err = |source| DiffError::Io {
        path: file.target.clone(),
        source,
    };
    let content = match &file.action {
        Planned::Unchanged => return Ok(None),
        Planned::Write(content) => Some(content),
        Planned::Remove => None,
    };

    let (saved, mode) = if file.exists {
        let mode = std::fs::metadata(&file.target).map_err(io_err)?.permissions();
        let saved = backup.save(&file.rel, &file.target).map_err(io_err)?;
        (Some(saved), Some(mode))
    } else {
        (None, None)
    };

    let mut created_dirs = Vec::new();
    match content {
        Some(content) => {
            if let Some(parent) = file.target.parent() {
                created_dirs = create_dirs(parent).map_err(io_err)?;
            }
            if let Err(e) = write_atomic(&file.target, content, mode) {
                // The rename never happened, so only our directories need removing.
                for dir in created_dirs.iter().rev() {
                    let _ = std::fs::remove_dir(dir);
                }
                return Err(e);
            }
        }
        None => std::fs::remove_file(&file.target).map_err(io_err)?,
    }
    Ok(Some(JournalEntry {
        target: file.target.clone(),
        backup: saved,
        created_dirs,
    }))
}

/// Create missing ancestors of `dir`, returning the ones created (outermost first).
fn create_dirs(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut missing = Vec::new();
    let mut current = Some(dir);
    while let Some(path) = current {
        if path.exists() {
            break;
        }
        missing.push(path.to_path_buf());
        current = path.parent();
    }
    missing.reverse();
    for path in &missing {
        std::fs::create_dir(path)?;
    }
    Ok(missing)
}

/// Write through a temp file in the target's directory and rename over it.
fn write_atomic(
    target: &Path,
    content: &[u8],
    permissions: Option<std::fs::Permissions>,
) -> Result<(), DiffError> {
    let io_err = |source| DiffError::Io {
        path: target.to_path_buf(),
        source,
    };
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(content).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    if let Some(permissions) = permissions {
        std::fs::set_permissions(tmp.path(), permissions).map_err(io_err)?;
    }
    tmp.persist(target).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// Decide what `patch` turns the file at `target` into.
fn plan_file(patch: &FilePatch, target: &Path) -> Result<(bool, Planned), String> {
    if patch.is_rename() {
        return Err("renames are not supported".to_string());
    }
    if target.is_dir() {
        return Err("path is a directory".to_string());
    }
    let existing = match std::fs::read(target) {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(format!("cannot read file: {}", e)),
    };

    match patch.kind {
        ChangeKind::Create => {
            let created = apply_hunks("", &patch.hunks)?;
            match existing {
                None => Ok((false, Planned::Write(created.into_bytes()))),
                Some(bytes) if bytes == created.as_bytes() => Ok((true, Planned::Unchanged)),
                Some(_) => Err("file already exists with different content".to_string()),
            }
        }
        ChangeKind::Modify => {
            let bytes = existing.ok_or_else(|| "file does not exist".to_string())?;
            let original =
                String::from_utf8(bytes).map_err(|_| "file is not valid UTF-8".to_string())?;
            let updated = apply_hunks(&original, &patch.hunks)?;
            Ok((true, Planned::Write(updated.into_bytes())))
        }
        ChangeKind::Delete => {
            let bytes = existing.ok_or_else(|| "file does not exist".to_string())?;
            if !patch.hunks.is_empty() {
                let original =
                    String::from_utf8(bytes).map_err(|_| "file is not valid UTF-8".to_string())?;
                let remaining = apply_hunks(&original, &patch.hunks)?;
                if !remaining.is_empty() {
                    return Err("file has content the deletion does not account for".to_string());
                }
            }
            Ok((true, Planned::Remove))
        }
    }
}

/// Apply hunks to `original`.
///
/// Each hunk must match exactly at its stated line, or at the nearest
/// position at or after the end of the previous hunk.
pub(crate) fn apply_hunks(original: &str, hunks: &[Hunk]) -> Result<String, String> {
    let had_newline = original.ends_with('\n');
    let body = original.strip_suffix('\n').unwrap_or(original);
    let lines: Vec<&str> = if original.is_empty() {
        Vec::new()
    } else {
        body.split('\n').collect()
    };
    let crlf = lines.first().is_some_and(|l| l.ends_with('\r'));

    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut cursor = 0;
    let mut ends_at_eof = false;
    let mut missing_newline = false;

    for (n, hunk) in hunks.iter().enumerate() {
        let old: Vec<&str> = hunk.old_lines().collect();
        // A pure insertion names the line it goes after.
        let expected = if old.is_empty() {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        let pos = find_hunk(&lines, &old, expected, cursor).ok_or_else(|| {
            format!(
                "hunk {} (-{},{}) does not match the file contents",
                n + 1,
                hunk.old_start,
                hunk.old_count
            )
        })?;

        out.extend(lines[cursor..pos].iter().map(|l| l.to_string()));
        let mut at = pos;
        for line in &hunk.lines {
            match line.kind {
                LineKind::Context => {
                    out.push(lines[at].to_string());
                    at += 1;
                }
                LineKind::Remove => at += 1,
                LineKind::Add => {
                    if crlf {
                        out.push(format!("{}\r", line.content));
                    } else {
                        out.push(line.content.clone());
                    }
                }
            }
        }
        cursor = at;
        ends_at_eof = cursor == lines.len();
        missing_newline = hunk.new_missing_newline;
    }
    out.extend(lines[cursor..].iter().map(|l| l.to_string()));

    let trailing = if ends_at_eof || lines.is_empty() {
        !missing_newline
    } else {
        had_newline
    };
    let mut result = out.join("\n");
    if trailing && !out.is_empty() {
        result.push('\n');
    }
    Ok(result)
}

fn find_hunk(lines: &[&str], old: &[&str], expected: usize, min: usize) -> Option<usize> {
    let matches_at = |pos: usize| {
        pos + old.len() <= lines.len()
            && lines[pos..pos + old.len()]
                .iter()
                .zip(old)
                .all(|(have, want)| have.trim_end_matches('\r') == *want)
    };
    if old.is_empty() {
        return Some(expected.clamp(min, lines.len()));
    }
    let expected = expected.max(min);
    if matches_at(expected) {
        return Some(expected);
    }
    let max = lines.len().saturating_sub(old.len());
    for offset in 1..=lines.len() {
        if expected + offset <= max && matches_at(expected + offset) {
            return Some(expected + offset);
        }
        if let Some(before) = expected.checked_sub(offset)
            && before >= min
            && matches_at(before)
        {
            return Some(before);
        }
        if expected + offset > max && expected.saturating_sub(offset) <= min {
            break;
        }
    }
    None
}

/// Reject absolute paths, parent escapes, `.git` internals, symlink escapes
/// and paths outside the allow-list.
fn check_path(base: &Path, allowed: &[String], path: &str) -> Result<(), DiffError> {
    let reject = |reason: &str| DiffError::PathRejected {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    if path.is_empty() {
        return Err(reject("empty path"));
    }
    if path.contains('\0') {
        return Err(reject("path contains a NUL byte"));
    }
    let candidate = Path::new(path);
    if candidate.is_absolute() || path.starts_with('/') || path.starts_with('\\') {
        return Err(reject("absolute paths are not allowed"));
    }
    for component in candidate.components() {
        match component {
            Component::ParentDir => return Err(reject("path escapes the repository")),
            Component::Prefix(_) | Component::RootDir => {
                return Err(reject("absolute paths are not allowed"));
            }
            Component::Normal(name) if name == ".git" => {
                return Err(reject("paths inside .git are not allowed"));
            }
            _ => {}
        }
    }

    let rel = normalize(path);
    if rel.is_empty() {
        return Err(reject("path names the repository root"));
    }
    if !allowed.is_empty() && !allowed.iter().any(|prefix| prefix_allows(prefix, &rel)) {
        return Err(reject("path is outside the allowed prefixes"));
    }

    // The nearest existing ancestor must resolve inside the base directory,
    // which catches symlinked directories and files pointing elsewhere.
    let full = base.join(&rel);
    let mut probe = Some(full.as_path());
    while let Some(current) = probe {
        if current.symlink_metadata().is_ok() {
            let resolved = current
                .canonicalize()
                .map_err(|_| reject("path resolves through a dangling symlink"))?;
            if !resolved.starts_with(base) {
                return Err(reject("path resolves outside the repository"));
            }
            break;
        }
        probe = current.parent();
    }
    Ok(())
}

fn prefix_allows(prefix: &str, rel: &str) -> bool {
    let prefix = normalize(prefix);
    prefix.is_empty()
        || rel == prefix
        || rel
            .strip_prefix(prefix.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
}
