//! Git LFS lock output parsing and read-only probing.
//!
//! `git lfs locks --json` prints one JSON array:
//!
//! ```text
//! [{"id":"42","path":"Content/Hero.uasset","owner":{"name":"alice"},"locked_at":"2024-05-01T10:00:00Z"}]
//! ```
//!
//! `git lfs lock` and `git lfs unlock` print `Locked <path>` / `Unlocked <path>`
//! per path on stdout and a message naming the path on stderr on failure.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::cache::LockState;
use crate::dispatch::OperationError;
use crate::runner::ProcessOutput;
use crate::util::normalize_path;

/// Lock holder as reported by the LFS server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LfsOwner {
    pub name: String,
}

/// One lock from `git lfs locks --json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LfsLock {
    pub id: String,
    pub path: String,
    pub owner: Option<LfsOwner>,
    #[serde(default)]
    pub locked_at: Option<String>,
}

impl LfsLock {
    pub fn owner_name(&self) -> &str {
        self.owner.as_ref().map(|o| o.name.as_str()).unwrap_or("")
    }
}

/// Parse the stdout of `git lfs locks --json`. Empty output means no locks.
pub fn parse_locks_json(lines: &[String]) -> Result<Vec<LfsLock>, serde_json::Error> {
    let text = lines.join("\n");
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut locks: Vec<LfsLock> = serde_json::from_str(&text)?;
    for lock in &mut locks {
        lock.path = normalize_path(&lock.path);
    }
    Ok(locks)
}

/// Which LFS command produced the output being parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCommand {
    Lock,
    Unlock,
}

impl LockCommand {
    pub fn subcommand(self) -> &'static str {
        match self {
            LockCommand::Lock => "lock",
            LockCommand::Unlock => "unlock",
        }
    }

    fn confirmation(self) -> &'static str {
        match self {
            LockCommand::Lock => "Locked ",
            LockCommand::Unlock => "Unlocked ",
        }
    }
}

fn is_denial(line: &str) -> bool {
    line.contains("Lock exists") || line.contains("already locked") || line.contains("locked by")
}

/// Per-path outcome of one `git lfs lock`/`unlock` batch.
///
/// A path is confirmed by a `Locked <path>` (or `Unlocked <path>`) line. An
/// unconfirmed lock whose stderr says it is already locked is `LockDenied`;
/// other unconfirmed paths carry the tool's message.
pub fn parse_lock_output(
    command: LockCommand,
    requested: &[String],
    out: &ProcessOutput,
) -> BTreeMap<String, Result<(), OperationError>> {
    let confirmed: Vec<String> = out
        .stdout_lines
        .iter()
        .filter_map(|l| l.trim().strip_prefix(command.confirmation()))
        .map(normalize_path)
        .collect();

    let mut outcomes = BTreeMap::new();
    for path in requested {
        let path = normalize_path(path);
        if confirmed.iter().any(|c| *c == path) {
            outcomes.insert(path, Ok(()));
            continue;
        }

        let mentions: Vec<&String> = out
            .stderr_lines
            .iter()
            .filter(|l| l.contains(path.as_str()))
            .collect();
        let message = mentions
            .first()
            .map(|l| l.trim().to_string())
            .unwrap_or_else(|| out.message());
        let error = match command {
            LockCommand::Lock => {
                if !mentions.iter().any(|l| is_denial(l)) {
                    log::warn!("Lock of {} not confirmed: {}", path, message);
                }
                OperationError::LockDenied {
                    path: path.clone(),
                    owner: None,
                }
            }
            LockCommand::Unlock => OperationError::ToolExit {
                code: out.exit_code,
                message,
            },
        };
        outcomes.insert(path, Err(error));
    }
    outcomes
}

/// Read-only attribute of a working-tree file; `None` when it does not exist.
pub fn is_read_only(root: &Path, path: &str) -> Option<bool> {
    std::fs::metadata(root.join(path))
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.permissions().readonly())
}

/// Paths whose lock state disagrees with the file's read-only attribute.
///
/// Git LFS keeps lockable files read-only unless the current user holds the
/// lock, so a file locked by someone else must be read-only and a file locked
/// by us must be writable. Missing files are skipped.
pub fn inconsistent_paths<'a, I>(root: &Path, candidates: I) -> Vec<String>
where
    I: IntoIterator<Item = (&'a String, &'a LockState)>,
{
    let mut flagged: Vec<String> = candidates
        .into_iter()
        .filter(|(path, lock)| match (lock, is_read_only(root, path)) {
            (LockState::LockedByOther(_), Some(false)) => true,
            (LockState::LockedByMe, Some(true)) => true,
            _ => false,
        })
        .map(|(path, _)| path.clone())
        .collect();
    flagged.sort();
    flagged.dedup();
    flagged
}
