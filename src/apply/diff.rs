//! Unified diff parsing.
//!
//! Accepts the output of `git diff` and plain `diff -u`: optional
//! `diff --git` headers with extended header lines, `---`/`+++` file
//! headers (`/dev/null` for creations and deletions) and `@@` hunks.
//! Hunk bodies are consumed by the counts in their header, so a removed
//! line that happens to start with `--` is never mistaken for a file header.

use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::errors::DiffError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Context,
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HunkLine {
    pub kind: LineKind,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<HunkLine>,
    /// A `\ No newline at end of file` marker followed the last new-side line.
    pub new_missing_newline: bool,
}

impl Hunk {
    /// Lines the original file must contain (context and removals).
    pub fn old_lines(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .filter(|l| l.kind != LineKind::Add)
            .map(|l| l.content.as_str())
    }
}

/// All changes to one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    /// `None` for creations.
    pub old_path: Option<String>,
    /// `None` for deletions.
    pub new_path: Option<String>,
    pub kind: ChangeKind,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    /// The path the change is reported under.
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }

    /// Every path this patch reads or writes (both names of a rename).
    pub fn touched_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = Vec::with_capacity(2);
        if let Some(old) = self.old_path.as_deref() {
            paths.push(old);
        }
        if let Some(new) = self.new_path.as_deref()
            && !paths.contains(&new)
        {
            paths.push(new);
        }
        paths
    }

    pub fn is_rename(&self) -> bool {
        matches!((&self.old_path, &self.new_path), (Some(a), Some(b)) if normalize(a) != normalize(b))
    }
}

/// The repository-relative form a path is written under: `./a//b/` → `a/b`.
///
/// Only normal components survive; `..` and roots are rejected separately
/// by the applier's path policy.
pub fn normalize(path: &str) -> String {
    Path::new(path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Default)]
struct FileBuilder {
    header_paths: Option<(String, String)>,
    old_path: Option<Option<String>>,
    new_path: Option<Option<String>>,
    new_file: bool,
    deleted_file: bool,
    hunks: Vec<Hunk>,
}

impl FileBuilder {
    fn has_file_headers(&self) -> bool {
        self.old_path.is_some() || self.new_path.is_some()
    }

    fn finish(self, line: usize) -> Result<Option<FilePatch>, DiffError> {
        let (old_path, new_path) = match (self.old_path, self.new_path) {
            (Some(old), Some(new)) => (old, new),
            (None, None) => match self.header_paths {
                Some((a, b)) => {
                    let old = (!self.new_file).then_some(a);
                    let new = (!self.deleted_file).then_some(b);
                    (old, new)
                }
                None => return Ok(None),
            },
            (Some(_), None) => {
                return Err(parse_error(line, "'---' header without matching '+++'"));
            }
            (None, Some(_)) => {
                return Err(parse_error(line, "'+++' header without preceding '---'"));
            }
        };
        let kind = match (&old_path, &new_path) {
            (None, Some(_)) => ChangeKind::Create,
            (Some(_), None) => ChangeKind::Delete,
            (Some(_), Some(_)) => ChangeKind::Modify,
            (None, None) => {
                return Err(parse_error(line, "both sides of a file patch are /dev/null"));
            }
        };
        // Mode-only changes carry nothing to apply.
        if kind == ChangeKind::Modify && self.hunks.is_empty() && old_path == new_path {
            return Ok(None);
        }
        Ok(Some(FilePatch {
            old_path,
            new_path,
            kind,
            hunks: self.hunks,
        }))
    }
}

fn parse_error(line: usize, message: impl Into<String>) -> DiffError {
    DiffError::Parse {
        line,
        message: message.into(),
    }
}

/// Parse unified diff text into one [`FilePatch`] per file, in diff order.
///
/// Text before the first file header (commit messages, prose) is ignored.
pub fn parse(text: &str) -> Result<Vec<FilePatch>, DiffError> {
    let lines: Vec<&str> = text.lines().collect();
    let mut files = Vec::new();
    let mut current: Option<FileBuilder> = None;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let line_no = i + 1;

        if let Some(rest) = line.strip_prefix("diff --git ") {
            if let Some(done) = current.take() {
                files.extend(done.finish(line_no)?);
            }
            current = Some(FileBuilder {
                header_paths: parse_git_header(rest),
                ..Default::default()
            });
            i += 1;
            continue;
        }

        if let Some(rest) = line.strip_prefix("--- ") {
            // A second `---` after hunks, or without a `diff --git` line,
            // starts the next file of a plain `diff -u` stream.
            let start_new = match &current {
                Some(b) => b.has_file_headers(),
                None => true,
            };
            if start_new {
                if let Some(done) = current.take() {
                    files.extend(done.finish(line_no)?);
                }
                current = Some(FileBuilder::default());
            }
            if let Some(builder) = current.as_mut() {
                builder.old_path = Some(parse_file_path(rest));
            }
            i += 1;
            continue;
        }

        if let Some(rest) = line.strip_prefix("+++ ") {
            match current.as_mut() {
                Some(b) if b.old_path.is_some() && b.new_path.is_none() => {
                    b.new_path = Some(parse_file_path(rest));
                }
                _ => return Err(parse_error(line_no, "'+++' header without preceding '---'")),
            }
            i += 1;
            continue;
        }

        if line.starts_with("@@") {
            let Some(builder) = current.as_mut() else {
                return Err(parse_error(line_no, "hunk outside of a file patch"));
            };
            if builder.old_path.is_none() || builder.new_path.is_none() {
                return Err(parse_error(line_no, "hunk before '---'/'+++' headers"));
            }
            let (hunk, next) = parse_hunk(&lines, i)?;
            builder.hunks.push(hunk);
            i = next;
            continue;
        }

        if let Some(builder) = current.as_mut() {
            if line.starts_with("new file mode") {
                builder.new_file = true;
            } else if line.starts_with("deleted file mode") {
                builder.deleted_file = true;
            } else if line.starts_with("Binary files") || line.starts_with("GIT binary patch") {
                return Err(parse_error(line_no, "binary patches are not supported"));
            } else if !builder.hunks.is_empty()
                && (line.starts_with('+') || line.starts_with('-') || line.starts_with(' '))
            {
                return Err(parse_error(
                    line_no,
                    "hunk has more lines than its header declares",
                ));
            }
        }
        i += 1;
    }

    if let Some(done) = current.take() {
        files.extend(done.finish(lines.len())?);
    }
    Ok(files)
}

/// Parse one hunk starting at `lines[start]`; returns it and the index of
/// the first line after it.
fn parse_hunk(lines: &[&str], start: usize) -> Result<(Hunk, usize), DiffError> {
    let (old_start, old_count, new_start, new_count) = parse_hunk_header(lines[start])
        .ok_or_else(|| parse_error(start + 1, format!("invalid hunk header '{}'", lines[start])))?;

    let mut hunk = Hunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: Vec::new(),
        new_missing_newline: false,
    };
    let (mut old_left, mut new_left) = (old_count, new_count);
    let mut i = start + 1;

    while old_left > 0 || new_left > 0 {
        let Some(line) = lines.get(i) else {
            return Err(parse_error(
                i,
                format!("hunk truncated: {} old and {} new lines missing", old_left, new_left),
            ));
        };
        let (kind, content) = match line.chars().next() {
            Some('+') => (LineKind::Add, &line[1..]),
            Some('-') => (LineKind::Remove, &line[1..]),
            Some(' ') => (LineKind::Context, &line[1..]),
            // Some generators strip the space from blank context lines.
            None => (LineKind::Context, ""),
            Some('\\') => {
                i += 1;
                continue;
            }
            Some(_) => {
                return Err(parse_error(i + 1, format!("unexpected line in hunk: '{}'", line)));
            }
        };
        match kind {
            LineKind::Context if old_left > 0 && new_left > 0 => {
                old_left -= 1;
                new_left -= 1;
            }
            LineKind::Add if new_left > 0 => new_left -= 1,
            LineKind::Remove if old_left > 0 => old_left -= 1,
            _ => {
                return Err(parse_error(
                    i + 1,
                    "hunk line counts do not match its header",
                ));
            }
        }
        hunk.lines.push(HunkLine {
            kind,
            content: content.to_string(),
        });
        i += 1;
    }

    if let Some(marker) = lines.get(i)
        && marker.starts_with('\\')
    {
        if hunk.lines.last().is_some_and(|l| l.kind != LineKind::Remove) {
            hunk.new_missing_newline = true;
        }
        i += 1;
    }
    Ok((hunk, i))
}

fn parse_hunk_header(line: &str) -> Option<(usize, usize, usize, usize)> {
    let trimmed = line.strip_prefix("@@ ")?;
    let ranges = trimmed.split(" @@").next()?.trim();
    let mut parts = ranges.split_whitespace();
    let (old_start, old_count) = parse_range(parts.next()?.strip_prefix('-')?)?;
    let (new_start, new_count) = parse_range(parts.next()?.strip_prefix('+')?)?;
    Some((old_start, old_count, new_start, new_count))
}

fn parse_range(value: &str) -> Option<(usize, usize)> {
    let mut parts = value.split(',');
    let start = parts.next()?.parse().ok()?;
    let count = match parts.next() {
        Some(count) => count.parse().ok()?,
        None => 1,
    };
    Some((start, count))
}

/// Path from a `---`/`+++` header. `None` for `/dev/null`.
fn parse_file_path(rest: &str) -> Option<String> {
    let path = rest.split('\t').next().unwrap_or(rest).trim();
    let path = path.trim_matches('"');
    if path == "/dev/null" {
        return None;
    }
    Some(strip_side_prefix(path).to_string())
}

fn parse_git_header(rest: &str) -> Option<(String, String)> {
    let mut parts = rest.split_whitespace();
    let a = parts.next()?;
    let b = parts.next()?;
    Some((strip_side_prefix(a).to_string(), strip_side_prefix(b).to_string()))
}

fn strip_side_prefix(path: &str) -> &str {
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
}
