//! Small shared helpers.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the inner value if a previous holder panicked.
///
/// The caches guarded this way hold plain data; a panic on one caller thread
/// must not take the whole provider down with it.
pub(crate) fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Normalize a caller-supplied path into the repository-relative form used as
/// cache key: forward slashes, no leading `./`, no trailing slash.
pub fn normalize_path(path: &str) -> String {
    let mut p = path.replace('\\', "/");
    while let Some(rest) = p.strip_prefix("./") {
        p = rest.to_string();
    }
    while p.len() > 1 && p.ends_with('/') {
        p.pop();
    }
    p
}

/// Cache key for `path` in the working tree at `root`.
///
/// Absolute paths inside the tree are made relative to it (the root itself
/// becomes `.`); relative paths are taken as already relative to the root.
/// Absolute paths outside the tree are only normalized.
pub fn repo_relative(root: &Path, path: &str) -> String {
    let candidate = Path::new(path);
    if !candidate.is_absolute() {
        return normalize_path(path);
    }
    match strip_root(root, candidate) {
        Some(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Some(rel) => normalize_path(&rel.to_string_lossy()),
        None => {
            log::debug!("{} is outside {}", path, root.display());
            normalize_path(path)
        }
    }
}

/// `path` relative to `root`, looking through symlinks on either side
/// (`/tmp` vs `/private/tmp`). The path itself does not need to exist.
fn strip_root(root: &Path, path: &Path) -> Option<PathBuf> {
    if let Ok(rel) = path.strip_prefix(root) {
        return Some(rel.to_path_buf());
    }

    let root = root.canonicalize().ok()?;
    let mut existing = path;
    let mut missing = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let full = missing.iter().rev().fold(canonical, |acc, part| acc.join(part));
            return full.strip_prefix(&root).ok().map(Path::to_path_buf);
        }
        missing.push(existing.file_name()?);
        existing = existing.parent()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("Content/a.uasset"), "Content/a.uasset");
        assert_eq!(normalize_path("./Content/a.uasset"), "Content/a.uasset");
        assert_eq!(normalize_path("Content\\Maps\\b.umap"), "Content/Maps/b.umap");
        assert_eq!(normalize_path("Content/"), "Content");
    }

    #[test]
    fn test_repo_relative_strips_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir(root.join("Content")).unwrap();
        std::fs::write(root.join("Content/a.uasset"), "a").unwrap();

        let abs = root.join("Content/a.uasset");
        assert_eq!(repo_relative(root, &abs.to_string_lossy()), "Content/a.uasset");
        assert_eq!(repo_relative(root, "Content/a.uasset"), "Content/a.uasset");
        assert_eq!(repo_relative(root, &root.to_string_lossy()), ".");

        // Not created yet, e.g. a rename destination.
        let new = root.join("Content/Maps/new.umap");
        assert_eq!(repo_relative(root, &new.to_string_lossy()), "Content/Maps/new.umap");
    }

    #[test]
    fn test_repo_relative_through_symlinked_root() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        std::fs::write(real.join("a.uasset"), "a").unwrap();
        let link = dir.path().join("link");
        #[cfg(unix)]
        std::os::unix::fs::symlink(&real, &link).unwrap();
        #[cfg(not(unix))]
        let link = real.clone();

        let abs = real.join("a.uasset");
        assert_eq!(repo_relative(&link, &abs.to_string_lossy()), "a.uasset");
    }

    #[test]
    fn test_repo_relative_keeps_outside_paths() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let outside = other.path().join("b.uasset");
        let key = repo_relative(dir.path(), &outside.to_string_lossy());
        assert_eq!(key, normalize_path(&outside.to_string_lossy()));
    }

    #[test]
    fn test_lock_recover_after_panic() {
        let mutex = Arc::new(Mutex::new(5));
        let clone = Arc::clone(&mutex);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert!(mutex.is_poisoned());
        assert_eq!(*lock_recover(&mutex), 5);
    }
}
