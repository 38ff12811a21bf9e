//! Files written when initializing a new project repository.

use std::io;
use std::path::Path;

/// Build products and per-user files of an editor project.
pub const GITIGNORE: &str = "\
Binaries/
DerivedDataCache/
Intermediate/
Saved/
.vs/
.vscode/
.idea/
*.sln
*.suo
*.VC.db
*.opensdf
*.sdf
";

/// Binary asset extensions stored in LFS.
const LFS_EXTENSIONS: &[&str] = &[
    "uasset", "umap", "png", "jpg", "tga", "psd", "exr", "hdr", "fbx", "obj", "wav", "mp3", "ogg",
    "mp4", "bin", "ttf", "otf",
];

/// Assets that can be locked: only one user may edit them at a time.
const LOCKABLE_EXTENSIONS: &[&str] = &["uasset", "umap"];

/// `.gitattributes` contents tracking binary assets with LFS.
pub fn gitattributes(lockable: bool) -> String {
    let mut out = String::new();
    for ext in LFS_EXTENSIONS {
        out.push_str(&format!("*.{} filter=lfs diff=lfs merge=lfs -text", ext));
        if lockable && LOCKABLE_EXTENSIONS.contains(ext) {
            out.push_str(" lockable");
        }
        out.push('\n');
    }
    out
}

/// Write `name` under `root` unless it already exists. Returns whether the
/// file was written.
fn write_new(root: &Path, name: &str, contents: &str) -> io::Result<bool> {
    let path = root.join(name);
    if path.exists() {
        log::info!("{} already exists, leaving it alone", path.display());
        return Ok(false);
    }
    std::fs::write(&path, contents)?;
    log::debug!("Wrote {}", path.display());
    Ok(true)
}

pub fn write_gitignore(root: &Path) -> io::Result<bool> {
    write_new(root, ".gitignore", GITIGNORE)
}

pub fn write_gitattributes(root: &Path, lockable: bool) -> io::Result<bool> {
    write_new(root, ".gitattributes", &gitattributes(lockable))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_gitattributes_lockable_only_for_assets() {
        let text = gitattributes(true);
        assert!(text.contains("*.uasset filter=lfs diff=lfs merge=lfs -text lockable\n"));
        assert!(text.contains("*.png filter=lfs diff=lfs merge=lfs -text\n"));
        assert!(!gitattributes(false).contains("lockable"));
    }

    #[test]
    fn test_existing_files_are_not_overwritten() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "custom\n").unwrap();

        assert!(!write_gitignore(dir.path()).unwrap());
        assert_eq!(
            std::fs::read_to_string(dir.path().join(".gitignore")).unwrap(),
            "custom\n"
        );

        assert!(write_gitattributes(dir.path(), true).unwrap());
        assert!(dir.path().join(".gitattributes").exists());
    }
}
