//! Read-only repository introspection using libgit2.
//!
//! Only read paths go through libgit2; every mutation is a git CLI call made
//! by the worker.

use std::path::{Path, PathBuf};

use git2::{BranchType, Repository};

/// What the provider knows about the working tree it is bound to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryInfo {
    /// Working tree root.
    pub root: PathBuf,
    pub git_dir: PathBuf,
    /// Current branch; `None` on a detached HEAD.
    pub branch: Option<String>,
    /// Upstream of the current branch, e.g. `origin/main`.
    pub upstream: Option<String>,
    pub remote_url: Option<String>,
    pub user_name: Option<String>,
    pub user_email: Option<String>,
    /// HEAD commit; `None` before the first commit.
    pub head: Option<String>,
}

impl RepositoryInfo {
    /// Discover the repository containing `start`.
    pub fn discover(start: &Path, remote_name: &str) -> Result<Self, git2::Error> {
        let repo = Repository::discover(start)?;
        let root = repo
            .workdir()
            .ok_or_else(|| git2::Error::from_str("bare repositories are not supported"))?
            .to_path_buf();

        let mut info = RepositoryInfo {
            root,
            git_dir: repo.path().to_path_buf(),
            head: head_commit(&repo),
            ..Default::default()
        };

        if let Ok(head) = repo.head() {
            if head.is_branch() {
                info.branch = head.shorthand().map(str::to_string);
            }
        } else if let Ok(reference) = repo.find_reference("HEAD") {
            // Unborn branch: HEAD points at a ref that does not exist yet.
            info.branch = reference
                .symbolic_target()
                .and_then(|t| t.strip_prefix("refs/heads/"))
                .map(str::to_string);
        }

        if let Some(branch) = &info.branch {
            info.upstream = repo
                .find_branch(branch, BranchType::Local)
                .and_then(|b| b.upstream())
                .ok()
                .and_then(|u| u.name().ok().flatten().map(str::to_string));
        }

        info.remote_url = repo
            .find_remote(remote_name)
            .ok()
            .and_then(|r| r.url().map(str::to_string));

        if let Ok(config) = repo.config() {
            info.user_name = config.get_string("user.name").ok();
            info.user_email = config.get_string("user.email").ok();
        }

        Ok(info)
    }
}

fn head_commit(repo: &Repository) -> Option<String> {
    repo.head()
        .ok()
        .and_then(|h| h.peel_to_commit().ok())
        .map(|c| c.id().to_string())
}

/// HEAD commit of the repository at `root`, if any.
pub fn head_revision(root: &Path) -> Option<String> {
    Repository::open(root).ok().and_then(|r| head_commit(&r))
}
