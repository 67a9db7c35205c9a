//! Git integration module.
//!
//! Provides repository detection and cloning for the checkout action.

use std::path::{Path, PathBuf};

use git2::{Repository, StatusOptions};

use crate::provision::Revision;

/// Git repository wrapper with high-level operations.
pub struct GitRepository {
    repo: Repository,
}

impl GitRepository {
    /// Open a Git repository from the given path.
    ///
    /// This will search up the directory tree to find a Git repository.
    #[must_use]
    pub fn discover(path: impl AsRef<Path>) -> Option<Self> {
        Repository::discover(path.as_ref()).ok().map(|repo| Self { repo })
    }

    /// Clone `url` into `dest`.
    pub fn clone_into(url: &str, dest: &Path) -> Result<Self, git2::Error> {
        tracing::debug!(url, dest = ?dest, "Cloning repository");
        Repository::clone(url, dest).map(|repo| Self { repo })
    }

    /// Get the repository root path.
    #[must_use]
    pub fn root(&self) -> Option<PathBuf> {
        self.repo.workdir().map(Path::to_path_buf)
    }

    /// Get the current branch name.
    #[must_use]
    pub fn current_branch(&self) -> Option<String> {
        let head = self.repo.head().ok()?;

        if head.is_branch() {
            head.shorthand().map(String::from)
        } else {
            // Detached HEAD - return None
            None
        }
    }

    /// Full SHA of the commit HEAD points to.
    #[must_use]
    pub fn head_sha(&self) -> Option<String> {
        self.repo.head().ok()?.peel_to_commit().ok().map(|c| c.id().to_string())
    }

    /// Whether any tracked or untracked file differs from HEAD.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(false)
            .include_ignored(false)
            .include_unmodified(false);

        self.repo.statuses(Some(&mut opts)).is_ok_and(|statuses| !statuses.is_empty())
    }

    /// The checked-out revision, if HEAD points at a commit.
    #[must_use]
    pub fn revision(&self) -> Option<Revision> {
        Some(Revision { sha: self.head_sha()?, branch: self.current_branch(), dirty: self.is_dirty() })
    }
}
