//! Cross-process advisory lock on a working tree.
//!
//! The worker thread serializes operations inside one process; this lock does
//! the same across `gitsc` processes sharing a working tree. It lives at
//! `.git/gitsc.lock` and is held for the duration of one operation.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

const LOCK_FILE: &str = "gitsc.lock";

/// Longest sleep between two acquisition attempts.
const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Guard holding the working-tree lock; released on drop.
#[derive(Debug)]
pub struct RepoLock {
    file: File,
    path: PathBuf,
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

impl RepoLock {
    /// Lock file location for the working tree at `root`, or `None` when
    /// there is no `.git` directory yet (before init, or a linked worktree).
    pub fn path_for(root: &Path) -> Option<PathBuf> {
        let git_dir = root.join(".git");
        git_dir.is_dir().then(|| git_dir.join(LOCK_FILE))
    }

    /// Acquire the lock, polling with exponential backoff until `timeout`.
    /// Fails with `ErrorKind::TimedOut` when another process keeps it.
    pub fn acquire(path: &Path, timeout: Duration) -> io::Result<Self> {
        let file = open_lock_file(path)?;
        let start = Instant::now();
        let mut backoff = Duration::from_millis(10);

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!(
                                "working tree is locked by another process ({}), gave up after {:?}",
                                path.display(),
                                timeout
                            ),
                        ));
                    }
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
