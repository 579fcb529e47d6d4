use std::path::Path;

use git2::{ErrorCode, IndexAddOption, Repository, ResetType, Signature, Status, StatusOptions};

use crate::errors::CheckpointError;

/// Result of [`GitCheckpoint::create_checkpoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// `false` when the target is not a git working tree.
    pub created: bool,
    pub commit: Option<String>,
}

impl Checkpoint {
    fn skipped() -> Self {
        Self {
            created: false,
            commit: None,
        }
    }
}

/// Snapshot commits used to bracket an apply.
#[derive(Debug, Clone)]
pub struct GitCheckpoint {
    author_name: String,
    author_email: String,
}

impl Default for GitCheckpoint {
    fn default() -> Self {
        Self::new("coderun", "coderun@localhost")
    }
}

impl GitCheckpoint {
    pub fn new(author_name: impl Into<String>, author_email: impl Into<String>) -> Self {
        Self {
            author_name: author_name.into(),
            author_email: author_email.into(),
        }
    }

    /// Commit every change in the working tree (additions, modifications and
    /// deletions) on top of HEAD.
    ///
    /// If the tree already matches HEAD no commit is made and HEAD is
    /// returned. Non-git directories yield `created: false`.
    pub fn create_checkpoint(&self, path: &Path, label: &str) -> Result<Checkpoint, CheckpointError> {
        let Some(repo) = open_worktree(path)? else {
            return Ok(Checkpoint::skipped());
        };

        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let parent = head_commit(&repo);

        if let Some(parent) = &parent
            && parent.tree_id() == tree_id
        {
            return Ok(Checkpoint {
                created: true,
                commit: Some(parent.id().to_string()),
            });
        }

        let sig = Signature::now(&self.author_name, &self.author_email)?;
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, label, &tree, &parents)?;

        Ok(Checkpoint {
            created: true,
            commit: Some(commit_id.to_string()),
        })
    }

    /// Hard-reset HEAD, index and working tree to `commit`, then delete
    /// untracked files. Ignored files are left alone.
    pub fn rollback(&self, path: &Path, commit: &str) -> Result<(), CheckpointError> {
        let repo = Repository::open(path)?;
        let oid = git2::Oid::from_str(commit)?;
        let target = repo.find_commit(oid)?;
        repo.reset(target.as_object(), ResetType::Hard, None)?;

        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let untracked: Vec<String> = repo
            .statuses(Some(&mut opts))?
            .iter()
            .filter(|entry| entry.status().contains(Status::WT_NEW))
            .filter_map(|entry| entry.path().map(str::to_string))
            .collect();

        for rel in untracked {
            let full = path.join(&rel);
            std::fs::remove_file(&full).map_err(|source| CheckpointError::Io {
                path: full.clone(),
                source,
            })?;
            prune_empty_dirs(path, full.parent());
        }
        Ok(())
    }

    /// HEAD commit hash, or `None` for non-git directories and unborn branches.
    pub fn current_head(path: &Path) -> Result<Option<String>, CheckpointError> {
        let Some(repo) = open_worktree(path)? else {
            return Ok(None);
        };
        Ok(head_commit(&repo).map(|c| c.id().to_string()))
    }
}

fn open_worktree(path: &Path) -> Result<Option<Repository>, CheckpointError> {
    match Repository::open(path) {
        Ok(repo) if repo.is_bare() => Ok(None),
        Ok(repo) => Ok(Some(repo)),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// HEAD commit if it exists (`None` on an unborn branch).
fn head_commit(repo: &Repository) -> Option<git2::Commit<'_>> {
    repo.head().ok().and_then(|head| head.peel_to_commit().ok())
}

fn prune_empty_dirs(root: &Path, mut dir: Option<&Path>) {
    while let Some(current) = dir {
        if current == root || !current.starts_with(root) {
            break;
        }
        if std::fs::remove_dir(current).is_err() {
            break;
        }
        dir = current.parent();
    }
}
