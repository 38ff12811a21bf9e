//! Per-file revision-control state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Working-tree status of a file as reported by `git status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    #[default]
    Unknown,
    Unmodified,
    Added,
    Modified,
    Deleted,
    Renamed,
    Conflicted,
    Untracked,
    Ignored,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Unknown => "unknown",
            FileStatus::Unmodified => "unmodified",
            FileStatus::Added => "added",
            FileStatus::Modified => "modified",
            FileStatus::Deleted => "deleted",
            FileStatus::Renamed => "renamed",
            FileStatus::Conflicted => "conflicted",
            FileStatus::Untracked => "untracked",
            FileStatus::Ignored => "ignored",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Git LFS lock state of a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state", content = "owner")]
pub enum LockState {
    #[default]
    Unlocked,
    LockedByMe,
    LockedByOther(String),
}

impl LockState {
    pub fn is_locked(&self) -> bool {
        !matches!(self, LockState::Unlocked)
    }

    /// Owner name when someone else holds the lock.
    pub fn other_owner(&self) -> Option<&str> {
        match self {
            LockState::LockedByOther(owner) => Some(owner),
            _ => None,
        }
    }
}

/// Cached state of one repository-relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub path: String,
    pub status: FileStatus,
    pub lock: LockState,
    /// HEAD commit observed at the last successful refresh.
    pub last_known_revision: Option<String>,
    /// Source path when `status` is `Renamed`.
    pub renamed_from: Option<String>,
    /// Set when a mutation was enqueued for this path; cleared by the next
    /// successful refresh.
    pub stale: bool,
}

impl FileState {
    /// A record for a path the cache knows nothing about.
    pub fn unknown(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            status: FileStatus::Unknown,
            lock: LockState::Unlocked,
            last_known_revision: None,
            renamed_from: None,
            stale: false,
        }
    }

    pub fn with_status(path: impl Into<String>, status: FileStatus) -> Self {
        Self {
            status,
            ..Self::unknown(path)
        }
    }

    pub fn is_source_controlled(&self) -> bool {
        !matches!(
            self.status,
            FileStatus::Unknown | FileStatus::Untracked | FileStatus::Ignored
        )
    }

    pub fn is_modified(&self) -> bool {
        matches!(
            self.status,
            FileStatus::Added
                | FileStatus::Modified
                | FileStatus::Deleted
                | FileStatus::Renamed
                | FileStatus::Conflicted
        )
    }

    pub fn is_conflicted(&self) -> bool {
        self.status == FileStatus::Conflicted
    }

    pub fn is_checked_out(&self) -> bool {
        self.lock == LockState::LockedByMe
    }

    pub fn checked_out_by_other(&self) -> Option<&str> {
        self.lock.other_owner()
    }

    pub fn can_add(&self) -> bool {
        self.status == FileStatus::Untracked
    }

    /// Whether an LFS lock can be taken on this file.
    pub fn can_checkout(&self, using_lfs_locking: bool) -> bool {
        using_lfs_locking && self.lock == LockState::Unlocked && self.is_source_controlled()
    }

    /// Whether the file may be edited without taking a lock first.
    pub fn can_edit(&self, using_lfs_locking: bool) -> bool {
        !using_lfs_locking || self.is_checked_out() || self.status == FileStatus::Added
    }

    pub fn can_check_in(&self) -> bool {
        if self.status == FileStatus::Added {
            return true;
        }
        if self.is_conflicted() {
            return false;
        }
        if self.is_checked_out() {
            return true;
        }
        self.checked_out_by_other().is_none() && self.is_modified() && self.is_source_controlled()
    }

    /// Local modifications can be reverted even when someone else holds the lock.
    pub fn can_revert(&self) -> bool {
        self.can_check_in() || self.is_modified()
    }

    pub fn can_delete(&self) -> bool {
        self.checked_out_by_other().is_none() && self.is_source_controlled()
    }

    /// Short human-readable label for UI badges.
    pub fn display_name(&self) -> String {
        if let Some(owner) = self.checked_out_by_other() {
            return format!("Checked out by: {}", owner);
        }
        match self.status {
            FileStatus::Conflicted => "Conflicted".into(),
            FileStatus::Added => "Opened for add".into(),
            FileStatus::Untracked => "Not under revision control".into(),
            FileStatus::Deleted => "Marked for delete".into(),
            FileStatus::Renamed => match &self.renamed_from {
                Some(from) => format!("Renamed from {}", from),
                None => "Renamed".into(),
            },
            FileStatus::Modified => "Checked out".into(),
            FileStatus::Ignored => "Ignored".into(),
            FileStatus::Unmodified if self.is_checked_out() => "Checked out".into(),
            FileStatus::Unmodified => "Unmodified".into(),
            FileStatus::Unknown => "Unknown".into(),
        }
    }
}
