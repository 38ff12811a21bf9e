//! Git CLI wrapper.
//!
//! All git and git-lfs invocations are built here:
//! - `GIT_TERMINAL_PROMPT=0` - never block on a credential prompt
//! - `core.quotepath=off` - non-ASCII paths come back verbatim in porcelain output
//! - stdin is null (set by the runner)
//!
//! Multi-path commands are split into batches of [`BATCH_LIMIT`] paths.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::process::{Invocation, ProcessError, ProcessOutput, ProcessRunner};

/// Maximum number of paths passed to a single git invocation.
pub const BATCH_LIMIT: usize = 50;

/// Errors returned by git operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// The process could not be run.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Validate that a git ref (branch or remote name) does not contain dangerous patterns.
///
/// Rejects:
/// - Empty strings
/// - Strings containing `..`
/// - Strings starting with `-` (could be interpreted as flags)
/// - Strings containing null bytes or control characters
pub fn validate_git_ref(value: &str, name: &str) -> Result<(), GitError> {
    if value.is_empty() {
        return Err(GitError::InvalidInput(format!("{} cannot be empty", name)));
    }
    if value.contains("..") {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain '..'",
            name
        )));
    }
    validate_argument(value, name)
}

/// Validate a free-form value passed as a positional argument (remote URL, path).
pub fn validate_argument(value: &str, name: &str) -> Result<(), GitError> {
    if value.is_empty() {
        return Err(GitError::InvalidInput(format!("{} cannot be empty", name)));
    }
    if value.starts_with('-') {
        return Err(GitError::InvalidInput(format!(
            "{} cannot start with '-'",
            name
        )));
    }
    if value.bytes().any(|b| b < 0x20) {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain null or control characters",
            name
        )));
    }
    Ok(())
}

/// Split a path list into invocation-sized batches.
pub fn batches(paths: &[String]) -> std::slice::Chunks<'_, String> {
    paths.chunks(BATCH_LIMIT)
}

/// Git version and fork information parsed from `git version`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// Fork tag such as `windows` or `vfs`, if any.
    pub fork: Option<String>,
    pub fork_major: u32,
    pub fork_minor: u32,
    pub fork_patch: u32,
}

impl GitVersion {
    /// Parse `git version 2.31.1.vfs.0.3`, `git version 2.11.0.windows.3`,
    /// `git version 2.39.2 (Apple Git-143)` and plain `git version 2.43.0`.
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.trim().strip_prefix("git version ")?;
        let token = rest.split_whitespace().next()?;
        let mut parts = token.split('.');

        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);

        let mut version = GitVersion {
            major,
            minor,
            patch,
            ..Default::default()
        };

        if let Some(fork) = parts.next() {
            version.fork = Some(fork.to_string());
            version.fork_major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
            version.fork_minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
            version.fork_patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        }

        Some(version)
    }

    /// True when this version is at least `major.minor`.
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

impl std::fmt::Display for GitVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(fork) = &self.fork {
            write!(f, ".{}.{}", fork, self.fork_major)?;
        }
        Ok(())
    }
}

/// Locate a `git` executable on `PATH`.
pub fn find_git_binary() -> Option<PathBuf> {
    let names: &[&str] = if cfg!(windows) {
        &["git.exe", "git.cmd"]
    } else {
        &["git"]
    };
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .flat_map(|dir| names.iter().map(move |n| dir.join(n)))
        .find(|candidate| candidate.is_file())
}

/// Git CLI bound to one working tree.
#[derive(Clone)]
pub struct GitTool {
    runner: Arc<dyn ProcessRunner>,
    binary: String,
    root: PathBuf,
}

impl GitTool {
    pub fn new(runner: Arc<dyn ProcessRunner>, binary: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            binary: binary.into(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn invocation(&self, timeout: Duration) -> Invocation {
        Invocation::new(&self.binary, &self.root, timeout)
            .env("GIT_TERMINAL_PROMPT", "0")
            .args(["-c", "core.quotepath=off"])
    }

    /// Run `git <args>` in the working tree.
    pub fn run<S: AsRef<str>>(&self, args: &[S], timeout: Duration) -> Result<ProcessOutput, GitError> {
        let inv = self
            .invocation(timeout)
            .args(args.iter().map(|a| a.as_ref().to_string()));
        Ok(self.runner.run(&inv)?)
    }

    /// Run `git <args> -- <paths>` once per batch.
    ///
    /// Stops at the first batch that exits non-zero; the returned outputs end
    /// with that failed batch. An empty path list runs once without a pathspec.
    pub fn run_batched<S: AsRef<str>>(
        &self,
        args: &[S],
        paths: &[String],
        timeout: Duration,
    ) -> Result<Vec<ProcessOutput>, GitError> {
        if paths.is_empty() {
            return Ok(vec![self.run(args, timeout)?]);
        }

        let mut outputs = Vec::new();
        for batch in batches(paths) {
            let mut full: Vec<String> = args.iter().map(|a| a.as_ref().to_string()).collect();
            full.push("--".to_string());
            full.extend(batch.iter().cloned());

            let out = self.run(&full, timeout)?;
            let failed = !out.success();
            outputs.push(out);
            if failed {
                break;
            }
        }
        Ok(outputs)
    }

    /// Run `git version` and parse the result.
    pub fn version(&self, timeout: Duration) -> Result<Option<GitVersion>, GitError> {
        let out = self.run(&["version"], timeout)?;
        Ok(out.stdout_lines.first().and_then(|l| GitVersion::parse(l)))
    }
}
