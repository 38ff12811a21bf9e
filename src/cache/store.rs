//! In-memory file state cache.
//!
//! Written by the dispatcher's worker thread, read from any thread. A single
//! mutex guards the whole map; operations are rare compared to the latency of
//! the git process that produces them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::state::{FileState, LockState};
use crate::util::{lock_recover, normalize_path};

/// Cache of [`FileState`] records keyed by repository-relative path.
#[derive(Debug, Default)]
pub struct StateCache {
    states: Mutex<HashMap<String, FileState>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached record for `path`, or an `Unknown` record if the path was never seen.
    pub fn get(&self, path: &str) -> FileState {
        let path = normalize_path(path);
        lock_recover(&self.states)
            .get(&path)
            .cloned()
            .unwrap_or_else(|| FileState::unknown(path))
    }

    pub fn contains(&self, path: &str) -> bool {
        lock_recover(&self.states).contains_key(&normalize_path(path))
    }

    /// Mark records stale without removing them, so the last known value stays visible.
    pub fn invalidate(&self, paths: &[String]) {
        let mut states = lock_recover(&self.states);
        for path in paths {
            let path = normalize_path(path);
            if let Some(state) = states.get_mut(&path) {
                state.stale = true;
            }
            // A directory target invalidates everything cached below it.
            let prefix = format!("{}/", path);
            for (key, state) in states.iter_mut() {
                if key.starts_with(&prefix) {
                    state.stale = true;
                }
            }
        }
    }

    /// Mark every record stale.
    pub fn invalidate_all(&self) {
        for state in lock_recover(&self.states).values_mut() {
            state.stale = true;
        }
    }

    /// Store refreshed working-tree states. The lock field of existing records is
    /// kept; it is owned by the lock registry. Every applied record is fresh.
    pub fn apply(&self, refreshed: BTreeMap<String, FileState>) {
        let mut states = lock_recover(&self.states);
        for (path, mut fresh) in refreshed {
            fresh.stale = false;
            match states.get_mut(&path) {
                Some(existing) => {
                    existing.status = fresh.status;
                    existing.renamed_from = fresh.renamed_from;
                    existing.last_known_revision = fresh.last_known_revision;
                    existing.stale = false;
                }
                None => {
                    states.insert(path, fresh);
                }
            }
        }
    }

    /// Replace lock information for all cached paths: paths in `locks` take the
    /// given state, every other record becomes unlocked. Locked paths that are
    /// not cached yet get a record so their lock owner is visible.
    pub fn apply_locks(&self, locks: &HashMap<String, LockState>) {
        let mut states = lock_recover(&self.states);
        for (path, state) in states.iter_mut() {
            state.lock = locks.get(path).cloned().unwrap_or(LockState::Unlocked);
        }
        for (path, lock) in locks {
            states
                .entry(path.clone())
                .or_insert_with(|| FileState::unknown(path.clone()))
                .lock = lock.clone();
        }
    }

    /// Update the lock of a single path.
    pub fn set_lock(&self, path: &str, lock: LockState) {
        let path = normalize_path(path);
        lock_recover(&self.states)
            .entry(path.clone())
            .or_insert_with(|| FileState::unknown(path))
            .lock = lock;
    }

    pub fn remove(&self, path: &str) -> bool {
        lock_recover(&self.states)
            .remove(&normalize_path(path))
            .is_some()
    }

    /// All cached paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = lock_recover(&self.states).keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Cached paths below the directory `dir`, sorted. `.` is the whole tree.
    pub fn paths_under(&self, dir: &str) -> Vec<String> {
        let dir = normalize_path(dir);
        if dir == "." {
            return self.paths();
        }
        let prefix = format!("{}/", dir);
        let mut paths: Vec<String> = lock_recover(&self.states)
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    /// Records matching `predicate`, sorted by path.
    pub fn filter<F>(&self, predicate: F) -> Vec<FileState>
    where
        F: Fn(&FileState) -> bool,
    {
        let mut out: Vec<FileState> = lock_recover(&self.states)
            .values()
            .filter(|s| predicate(s))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    pub fn len(&self) -> usize {
        lock_recover(&self.states).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock_recover(&self.states).clear();
    }
}
