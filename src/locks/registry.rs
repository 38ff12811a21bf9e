//! Registry of Git LFS locks known to this provider.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::lfs::LfsLock;
use crate::cache::LockState;
use crate::util::{lock_recover, normalize_path};

/// A lock held on one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    pub owner: String,
    /// Server-side lock id; empty until a query reports it.
    pub id: String,
    pub locked_at: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    user: String,
    entries: BTreeMap<String, LockEntry>,
}

/// Path → lock entry map, classified against the configured lock user.
#[derive(Debug, Default)]
pub struct LockRegistry {
    inner: Mutex<Inner>,
}

impl LockRegistry {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                user: user.into(),
                entries: BTreeMap::new(),
            }),
        }
    }

    pub fn user(&self) -> String {
        lock_recover(&self.inner).user.clone()
    }

    pub fn set_user(&self, user: impl Into<String>) {
        lock_recover(&self.inner).user = user.into();
    }

    pub fn get(&self, path: &str) -> Option<LockEntry> {
        lock_recover(&self.inner)
            .entries
            .get(&normalize_path(path))
            .cloned()
    }

    /// Lock state of `path` from the point of view of the configured user.
    pub fn state(&self, path: &str) -> LockState {
        let inner = lock_recover(&self.inner);
        match inner.entries.get(&normalize_path(path)) {
            None => LockState::Unlocked,
            Some(entry) => classify(&inner.user, entry),
        }
    }

    /// Record a lock the current user just took.
    pub fn insert_mine(&self, path: &str) {
        let mut inner = lock_recover(&self.inner);
        let owner = inner.user.clone();
        inner.entries.insert(
            normalize_path(path),
            LockEntry {
                owner,
                id: String::new(),
                locked_at: None,
            },
        );
    }

    pub fn remove(&self, path: &str) -> Option<LockEntry> {
        lock_recover(&self.inner).entries.remove(&normalize_path(path))
    }

    /// Replace every entry with the result of a lock query. Entries the query
    /// no longer reports were released remotely.
    pub fn replace_all(&self, locks: Vec<LfsLock>) {
        let mut inner = lock_recover(&self.inner);
        let before = inner.entries.len();
        inner.entries = locks
            .into_iter()
            .map(|lock| {
                let entry = LockEntry {
                    owner: lock.owner_name().to_string(),
                    id: lock.id,
                    locked_at: lock.locked_at,
                };
                (lock.path, entry)
            })
            .collect();
        log::debug!(
            "Lock registry replaced: {} -> {} entries",
            before,
            inner.entries.len()
        );
    }

    /// All entries classified as lock states.
    pub fn states(&self) -> HashMap<String, LockState> {
        let inner = lock_recover(&self.inner);
        inner
            .entries
            .iter()
            .map(|(path, entry)| (path.clone(), classify(&inner.user, entry)))
            .collect()
    }

    pub fn entries(&self) -> Vec<(String, LockEntry)> {
        lock_recover(&self.inner)
            .entries
            .iter()
            .map(|(p, e)| (p.clone(), e.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        lock_recover(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock_recover(&self.inner).entries.clear();
    }
}

fn classify(user: &str, entry: &LockEntry) -> LockState {
    if !user.is_empty() && entry.owner == user {
        LockState::LockedByMe
    } else {
        LockState::LockedByOther(entry.owner.clone())
    }
}
