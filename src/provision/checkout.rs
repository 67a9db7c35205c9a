//! `actions/checkout`: make the source tree available.
//!
//! The workspace is normally already a clone, so checkout just records its
//! revision. With `repository:` set and no clone present, the repository is
//! cloned into the workspace (or `path:` below it). A directory that is not
//! a repository at all is accepted as-is.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Action, ActionInput, ActionOutcome, LineSink, ProvisionError, ProvisionResult};

/// The checked-out revision of a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Full commit SHA of HEAD
    pub sha: String,

    /// Current branch name (None if detached HEAD)
    pub branch: Option<String>,

    /// Whether the working directory has uncommitted changes
    pub dirty: bool,
}

impl Revision {
    /// Abbreviated SHA for display.
    #[must_use]
    pub fn short_sha(&self) -> &str {
        &self.sha[..self.sha.len().min(7)]
    }

    /// Get a display string for the branch (or "HEAD" if detached).
    #[must_use]
    pub fn branch_display(&self) -> &str {
        self.branch.as_deref().unwrap_or("HEAD")
    }
}

/// The checkout action.
pub struct Checkout;

#[async_trait]
impl Action for Checkout {
    async fn run(&self, input: ActionInput<'_>, _sink: LineSink<'_>) -> ProvisionResult<ActionOutcome> {
        let dest = match input.input("path") {
            Some(sub) => input.workspace.join(sub),
            None => input.workspace.to_path_buf(),
        };
        let repository = input.input("repository").map(clone_url);

        tokio::task::spawn_blocking(move || checkout(&dest, repository.as_deref()))
            .await
            .map_err(|e| ProvisionError::Checkout(e.to_string()))?
    }
}

/// Expand `owner/name` shorthand to a GitHub URL; anything else is used verbatim.
fn clone_url(repository: &str) -> String {
    let is_shorthand = !repository.contains(':')
        && !repository.starts_with(['/', '.', '~'])
        && repository.matches('/').count() == 1;

    if is_shorthand {
        format!("https://github.com/{repository}.git")
    } else {
        repository.to_string()
    }
}

fn is_empty_dir(path: &Path) -> std::io::Result<bool> {
    if !path.exists() {
        return Ok(true);
    }
    Ok(std::fs::read_dir(path)?.next().is_none())
}

fn plain_directory(dest: &Path) -> ProvisionResult<ActionOutcome> {
    if !dest.is_dir() {
        return Err(ProvisionError::Checkout(format!("workspace {} does not exist", dest.display())));
    }
    tracing::info!(workspace = ?dest, "Workspace is not a git repository, using it as-is");
    Ok(ActionOutcome {
        summary: Some(format!("Using plain directory {}", dest.display())),
        ..ActionOutcome::default()
    })
}

#[cfg(feature = "git")]
fn checkout(dest: &Path, repository: Option<&str>) -> ProvisionResult<ActionOutcome> {
    use crate::git::GitRepository;

    let existing = GitRepository::discover(dest);

    let repo = match (existing, repository) {
        // A clone requested into a directory that is already its own repository is reused.
        (Some(repo), Some(_)) if same_dir(repo.root().as_deref(), dest) => repo,
        (Some(repo), None) => repo,
        (_, Some(url)) => {
            if !is_empty_dir(dest)? {
                return Err(ProvisionError::Checkout(format!(
                    "cannot clone {url} into non-empty directory {}; set 'path'",
                    dest.display()
                )));
            }
            tracing::info!(url, dest = ?dest, "Cloning repository");
            GitRepository::clone_into(url, dest)
                .map_err(|e| ProvisionError::Checkout(e.message().to_string()))?
        }
        (None, None) => return plain_directory(dest),
    };

    let revision = repo.revision();
    let summary = match revision {
        Some(ref r) => {
            tracing::info!(sha = r.short_sha(), branch = r.branch_display(), dirty = r.dirty, "Checked out");
            format!("{} at {}{}", r.branch_display(), r.short_sha(), if r.dirty { " (dirty)" } else { "" })
        }
        None => {
            tracing::info!("Repository has no commits yet");
            "repository without commits".to_string()
        }
    };

    Ok(ActionOutcome { summary: Some(summary), revision, ..ActionOutcome::default() })
}

#[cfg(feature = "git")]
fn same_dir(root: Option<&Path>, dest: &Path) -> bool {
    let canonical = |p: &Path| p.canonicalize().unwrap_or_else(|_| p.to_path_buf());
    root.is_some_and(|root| canonical(root) == canonical(dest))
}

#[cfg(not(feature = "git"))]
fn checkout(dest: &Path, repository: Option<&str>) -> ProvisionResult<ActionOutcome> {
    if let Some(url) = repository {
        if is_empty_dir(dest)? {
            return Err(ProvisionError::Checkout(format!(
                "cannot clone {url}: built without git support"
            )));
        }
    }
    plain_directory(dest)
}
