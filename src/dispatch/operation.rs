//! Operation model: what a caller asks the worker to do and what came back.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;

use crate::runner::{GitError, ProcessError, ProcessOutput};

/// Monotonic operation identifier, unique within the process.
pub type OperationId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> OperationId {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Options for initializing a new repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitOptions {
    /// Write a `.gitignore` with editor project patterns.
    pub write_ignore: bool,
    /// Write a `.gitattributes` tracking binary assets with LFS.
    pub write_attributes: bool,
    /// Run `git lfs install --local`.
    pub use_lfs: bool,
    /// Mark LFS-tracked assets lockable in `.gitattributes`.
    pub lockable: bool,
    /// Add this URL as the default remote.
    pub remote_url: Option<String>,
    /// Create an initial commit with this message.
    pub initial_commit: Option<String>,
}

/// What an operation does, with its kind-specific parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    /// Refresh the status of the targets (all cached paths when empty).
    UpdateStatus,
    Add,
    Delete,
    /// Take LFS locks.
    CheckOut,
    /// Release LFS locks.
    Unlock,
    Revert,
    Commit { message: String, push: bool },
    Push,
    Pull,
    Fetch,
    /// Move the single target to `destination`.
    Rename { destination: String },
    /// Mark conflicted targets as resolved.
    Resolve,
    Init(InitOptions),
    /// Raw git command line.
    Console { args: Vec<String> },
    /// Query LFS locks on the remote.
    QueryLocks,
    /// Compare lock state with read-only attributes and re-query on mismatch.
    Reconcile,
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::UpdateStatus => "UpdateStatus",
            OperationKind::Add => "Add",
            OperationKind::Delete => "Delete",
            OperationKind::CheckOut => "CheckOut",
            OperationKind::Unlock => "Unlock",
            OperationKind::Revert => "Revert",
            OperationKind::Commit { .. } => "Commit",
            OperationKind::Push => "Push",
            OperationKind::Pull => "Pull",
            OperationKind::Fetch => "Fetch",
            OperationKind::Rename { .. } => "Rename",
            OperationKind::Resolve => "Resolve",
            OperationKind::Init(_) => "Init",
            OperationKind::Console { .. } => "Console",
            OperationKind::QueryLocks => "QueryLocks",
            OperationKind::Reconcile => "Reconcile",
        }
    }

    /// Whether the operation can change the state of its targets.
    /// Mutations mark targets stale on submit and refresh them on success.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            OperationKind::UpdateStatus
                | OperationKind::Fetch
                | OperationKind::QueryLocks
                | OperationKind::Reconcile
        )
    }

    /// Whether the operation talks to a remote and gets the network timeout.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            OperationKind::Push
                | OperationKind::Pull
                | OperationKind::Fetch
                | OperationKind::CheckOut
                | OperationKind::Unlock
                | OperationKind::QueryLocks
                | OperationKind::Reconcile
                | OperationKind::Commit { push: true, .. }
        )
    }

    /// Whether a successful run is followed by a status refresh.
    pub fn refreshes_after(&self) -> bool {
        self.is_mutation() || matches!(self, OperationKind::Fetch)
    }

    /// Whether the operation works on the whole working tree rather than only
    /// its targets.
    pub fn is_repository_wide(&self) -> bool {
        matches!(
            self,
            OperationKind::Pull | OperationKind::Init(_) | OperationKind::Console { .. }
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle of an operation. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationResult {
    #[default]
    NotRun,
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl OperationResult {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationResult::Succeeded | OperationResult::Failed | OperationResult::Cancelled
        )
    }
}

fn owner_suffix(owner: &Option<String>) -> String {
    match owner {
        Some(owner) => format!(" by {}", owner),
        None => String::new(),
    }
}

/// Typed error recorded on an operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// The tool binary could not be started.
    #[error("failed to start '{program}': {message}")]
    ProcessSpawn { program: String, message: String },
    /// The tool did not finish in time and was killed.
    #[error("'{program}' timed out after {timeout:?}")]
    ProcessTimeout { program: String, timeout: Duration },
    /// The tool exited non-zero.
    #[error("git exited with code {code}: {message}")]
    ToolExit { code: i32, message: String },
    /// The path is locked by someone else.
    #[error("{path} is locked{}", owner_suffix(.owner))]
    LockDenied { path: String, owner: Option<String> },
    #[error("merge conflict: {message}")]
    MergeConflict { message: String },
    #[error("network error: {message}")]
    Network { message: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not connected to a repository")]
    NotConnected,
    #[error("IO error: {0}")]
    Io(String),
}

impl From<ProcessError> for OperationError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::Spawn { program, source } => OperationError::ProcessSpawn {
                program,
                message: source.to_string(),
            },
            ProcessError::Timeout { program, timeout } => {
                OperationError::ProcessTimeout { program, timeout }
            }
            ProcessError::Io(e) => OperationError::Io(e.to_string()),
        }
    }
}

impl From<GitError> for OperationError {
    fn from(e: GitError) -> Self {
        match e {
            GitError::Process(e) => e.into(),
            GitError::InvalidInput(msg) => OperationError::InvalidRequest(msg),
        }
    }
}

impl From<std::io::Error> for OperationError {
    fn from(e: std::io::Error) -> Self {
        OperationError::Io(e.to_string())
    }
}

const NETWORK_SIGNATURES: &[&str] = &[
    "Could not resolve host",
    "unable to access",
    "Could not read from remote repository",
    "Connection refused",
    "Connection timed out",
    "Connection reset",
    "The remote end hung up",
    "early EOF",
    "Authentication failed",
    "SSL",
];

const CONFLICT_SIGNATURES: &[&str] = &[
    "CONFLICT",
    "unmerged",
    "Unmerged",
    "needs merge",
    "could not apply",
];

/// Classify a failed tool invocation.
///
/// Output naming merge conflicts becomes `MergeConflict`; remote commands whose
/// output looks like a transport failure become `Network`; everything else is
/// `ToolExit` with the first meaningful output line.
pub fn classify_failure(kind: &OperationKind, out: &ProcessOutput) -> OperationError {
    let lines = || out.stderr_lines.iter().chain(out.stdout_lines.iter());

    if let Some(line) = lines().find(|l| CONFLICT_SIGNATURES.iter().any(|s| l.contains(s))) {
        return OperationError::MergeConflict {
            message: line.trim().to_string(),
        };
    }
    if kind.is_network() {
        if let Some(line) = lines().find(|l| NETWORK_SIGNATURES.iter().any(|s| l.contains(s))) {
            return OperationError::Network {
                message: line.trim().to_string(),
            };
        }
    }
    OperationError::ToolExit {
        code: out.exit_code,
        message: out.message(),
    }
}

/// One unit of work for the dispatcher.
///
/// Created by the caller, moved into the dispatcher on submit and handed back
/// (to the synchronous caller or the completion callback) once terminal.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    /// Repository-relative paths.
    pub targets: Vec<String>,
    pub result: OperationResult,
    /// Raw stdout and stderr lines of every invocation.
    pub output_lines: Vec<String>,
    pub errors: Vec<OperationError>,
    /// Per-path results of lock and unlock.
    pub path_outcomes: BTreeMap<String, Result<(), OperationError>>,
    /// Paths flagged by reconcile.
    pub flagged: Vec<String>,
    /// Overrides the per-kind default timeout.
    pub timeout: Option<Duration>,
}

impl Operation {
    pub fn new<I, S>(kind: OperationKind, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: next_id(),
            kind,
            targets: targets
                .into_iter()
                .map(|t| crate::util::normalize_path(&t.into()))
                .collect(),
            result: OperationResult::NotRun,
            output_lines: Vec::new(),
            errors: Vec::new(),
            path_outcomes: BTreeMap::new(),
            flagged: Vec::new(),
            timeout: None,
        }
    }

    /// An operation without targets.
    pub fn repository(kind: OperationKind) -> Self {
        Self::new(kind, Vec::<String>::new())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn succeeded(&self) -> bool {
        self.result == OperationResult::Succeeded
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.to_string()).collect()
    }

    /// Append the raw output of one invocation.
    pub(crate) fn record(&mut self, out: &ProcessOutput) {
        self.output_lines.extend(out.stdout_lines.iter().cloned());
        self.output_lines.extend(out.stderr_lines.iter().cloned());
    }

    pub(crate) fn fail(&mut self, error: OperationError) {
        self.errors.push(error);
        self.result = OperationResult::Failed;
    }
}
