//! Short-lived record of paths refreshed by the worker.
//!
//! After every successful mutation the worker refreshes its targets. A caller
//! that forces an update right after completion would otherwise pay for a
//! second identical status query, so those paths are remembered briefly.

use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::util::normalize_path;

/// Default TTL for recently refreshed entries.
const DEFAULT_TTL: Duration = Duration::from_secs(2);

/// Paths whose status was refreshed within the last `ttl`.
pub struct RecentlyRefreshed {
    entries: DashMap<String, Instant>,
    ttl: Duration,
}

impl Default for RecentlyRefreshed {
    fn default() -> Self {
        Self::new()
    }
}

impl RecentlyRefreshed {
    /// Create with the default TTL.
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Check if a path was refreshed recently (and the entry has not expired).
    pub fn contains(&self, path: &str) -> bool {
        let path = normalize_path(path);
        if let Some(entry) = self.entries.get(&path) {
            if entry.elapsed() < self.ttl {
                return true;
            }
            // Entry expired, remove it
            drop(entry);
            self.entries.remove(&path);
        }
        false
    }

    /// True when every path in `paths` was refreshed recently.
    pub fn contains_all(&self, paths: &[String]) -> bool {
        !paths.is_empty() && paths.iter().all(|p| self.contains(p))
    }

    pub fn mark<'a, I>(&self, paths: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        let now = Instant::now();
        for path in paths {
            self.entries.insert(normalize_path(path), now);
        }
    }

    /// Forget paths, so the next forced read queries the tool again.
    pub fn forget(&self, paths: &[String]) {
        for path in paths {
            self.entries.remove(&normalize_path(path));
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_path_not_contained() {
        let recent = RecentlyRefreshed::new();
        assert!(!recent.contains("a.txt"));
        assert!(!recent.contains_all(&[]));
    }

    #[test]
    fn test_entries_expire() {
        let recent = RecentlyRefreshed::with_ttl(Duration::from_millis(10));
        let paths = vec!["a.txt".to_string(), "b.txt".to_string()];
        recent.mark(&paths);
        assert!(recent.contains_all(&paths));

        std::thread::sleep(Duration::from_millis(20));
        assert!(!recent.contains("a.txt"));
    }

    #[test]
    fn test_forget_and_normalization() {
        let recent = RecentlyRefreshed::new();
        recent.mark(&["./Content/a.uasset".to_string()]);
        assert!(recent.contains("Content/a.uasset"));

        recent.forget(&["Content/a.uasset".to_string()]);
        assert!(!recent.contains("Content/a.uasset"));
    }
}
