//! Provider-level errors and the last-errors sink.

use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;

use super::settings::SettingsError;
use crate::dispatch::Operation;
use crate::util::lock_recover;

/// Errors returned by the provider facade.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider is not started")]
    NotStarted,
    #[error("provider is already started")]
    AlreadyStarted,
    /// The worker thread is gone (stopped or panicked).
    #[error("worker thread is not available")]
    WorkerUnavailable,
    /// Synchronous execution from the worker thread would wait on itself.
    #[error("synchronous execution requested from the worker thread")]
    SyncFromWorker,
    #[error("git not found: {0}")]
    GitNotFound(String),
    #[error("no git repository at {0}")]
    RepositoryNotFound(PathBuf),
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Output fragments that mark a line as an error worth surfacing.
const ERROR_PATTERNS: &[&str] = &[
    "error:",
    "fatal:",
    "CONFLICT",
    "Lock exists",
    "rejected",
    "Could not",
    "unable to",
];

/// Lines of `output` that look like tool errors.
pub fn error_lines(output: &[String]) -> Vec<String> {
    output
        .iter()
        .filter(|l| ERROR_PATTERNS.iter().any(|p| l.contains(p)))
        .map(|l| l.trim().to_string())
        .collect()
}

/// Error messages to publish for a failed operation: matching output lines,
/// falling back to the operation's typed errors.
pub fn messages_for(op: &Operation) -> Vec<String> {
    let lines = error_lines(&op.output_lines);
    if lines.is_empty() {
        op.error_messages()
    } else {
        lines
    }
}

/// Holds the error messages of the latest command; last write wins.
#[derive(Debug, Default)]
pub struct ErrorSink {
    messages: Mutex<Vec<String>>,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_last_errors(&self, messages: Vec<String>) {
        *lock_recover(&self.messages) = messages;
    }

    pub fn last_errors(&self) -> Vec<String> {
        lock_recover(&self.messages).clone()
    }

    pub fn num_last_errors(&self) -> usize {
        lock_recover(&self.messages).len()
    }

    pub fn clear(&self) {
        lock_recover(&self.messages).clear();
    }
}
