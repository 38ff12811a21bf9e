//! Parser for `git status --porcelain=v1` output.
//!
//! Each line is `XY <path>` or `XY <orig> -> <path>` for renames and copies,
//! where `X` is the index status and `Y` the work-tree status. Paths with
//! special characters are C-quoted by git.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use super::state::{FileState, FileStatus};
use crate::util::{normalize_path, repo_relative};

/// One parsed porcelain line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub path: String,
    pub status: FileStatus,
    pub renamed_from: Option<String>,
}

/// Map the two porcelain status letters to a single file status.
fn classify(x: char, y: char) -> FileStatus {
    match (x, y) {
        ('?', '?') => FileStatus::Untracked,
        ('!', '!') => FileStatus::Ignored,
        ('D', 'D') | ('A', 'U') | ('U', 'D') | ('U', 'A') | ('D', 'U') | ('A', 'A') | ('U', 'U') => {
            FileStatus::Conflicted
        }
        ('R', _) | (_, 'R') => FileStatus::Renamed,
        ('C', _) | (_, 'C') => FileStatus::Added,
        ('A', _) => FileStatus::Added,
        ('D', _) | (_, 'D') => FileStatus::Deleted,
        ('M', _) | (_, 'M') | ('T', _) | (_, 'T') => FileStatus::Modified,
        (' ', ' ') => FileStatus::Unmodified,
        _ => FileStatus::Unknown,
    }
}

/// Read one possibly-quoted path from the start of `s`, returning the path
/// and the unconsumed remainder.
fn take_path(s: &str) -> (String, &str) {
    let Some(body) = s.strip_prefix('"') else {
        return match s.find(" -> ") {
            Some(idx) => (s[..idx].to_string(), &s[idx..]),
            None => (s.to_string(), ""),
        };
    };

    let mut bytes = Vec::new();
    let mut chars = body.char_indices();
    while let Some((idx, c)) = chars.next() {
        match c {
            '"' => {
                return (
                    String::from_utf8_lossy(&bytes).into_owned(),
                    &body[idx + 1..],
                );
            }
            '\\' => {
                let Some((_, esc)) = chars.next() else { break };
                match esc {
                    'n' => bytes.push(b'\n'),
                    't' => bytes.push(b'\t'),
                    'r' => bytes.push(b'\r'),
                    'a' => bytes.push(0x07),
                    'b' => bytes.push(0x08),
                    'f' => bytes.push(0x0c),
                    'v' => bytes.push(0x0b),
                    '0'..='7' => {
                        let mut value = esc.to_digit(8).unwrap_or(0);
                        for _ in 0..2 {
                            let next = chars.clone().next();
                            match next.and_then(|(_, d)| d.to_digit(8)) {
                                Some(d) => {
                                    value = value * 8 + d;
                                    chars.next();
                                }
                                None => break,
                            }
                        }
                        bytes.push(value as u8);
                    }
                    other => {
                        let mut buf = [0u8; 4];
                        bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                    }
                }
            }
            other => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    // Unterminated quote: keep what we have.
    (String::from_utf8_lossy(&bytes).into_owned(), "")
}

/// Parse one porcelain line. Header (`##`) and blank lines yield `None`.
pub fn parse_porcelain_line(line: &str) -> Option<StatusEntry> {
    if line.len() < 4 || line.starts_with('#') {
        return None;
    }
    let mut chars = line.chars();
    let x = chars.next()?;
    let y = chars.next()?;
    if chars.next()? != ' ' {
        return None;
    }
    let rest = chars.as_str();
    let status = classify(x, y);

    let (first, remainder) = take_path(rest);
    let (path, renamed_from) = match remainder.strip_prefix(" -> ") {
        Some(target) => {
            let (to, _) = take_path(target);
            (to, Some(first))
        }
        None => (first, None),
    };

    Some(StatusEntry {
        path: normalize_path(&path),
        status,
        renamed_from: renamed_from.map(|p| normalize_path(&p)),
    })
}

/// Parse a full porcelain listing.
pub fn parse_porcelain<S: AsRef<str>>(lines: &[S]) -> Vec<StatusEntry> {
    lines
        .iter()
        .filter_map(|l| parse_porcelain_line(l.as_ref()))
        .collect()
}

/// Turn one status batch into file states for the requested paths.
///
/// Every reported entry becomes a record. Requested paths the tool did not
/// mention are clean tracked files when they exist on disk (untracked and
/// ignored files are always listed) and unknown otherwise. Requested
/// directories contribute only the entries reported beneath them, so callers
/// list the cached children of a directory to have them cleared. Absolute
/// paths inside `root` are keyed by their repository-relative form.
pub fn states_for_batch(
    root: &Path,
    requested: &[String],
    entries: &[StatusEntry],
    revision: Option<&str>,
) -> BTreeMap<String, FileState> {
    let mut states = BTreeMap::new();

    for entry in entries {
        let mut state = FileState::with_status(&entry.path, entry.status);
        state.renamed_from = entry.renamed_from.clone();
        state.last_known_revision = revision.map(str::to_string);
        states.insert(entry.path.clone(), state);
    }

    let reported: HashSet<&str> = entries.iter().map(|e| e.path.as_str()).collect();
    for path in requested {
        let path = repo_relative(root, path);
        if reported.contains(path.as_str()) {
            continue;
        }
        let on_disk = root.join(&path);
        if on_disk.is_dir() {
            continue;
        }
        // Ignored directories are reported as `dir/`; files below them are ignored too.
        let under_ignored_dir = entries.iter().any(|e| {
            e.status == FileStatus::Ignored && path.starts_with(&format!("{}/", e.path))
        });
        let status = if under_ignored_dir {
            FileStatus::Ignored
        } else if on_disk.exists() {
            FileStatus::Unmodified
        } else {
            FileStatus::Unknown
        };
        let mut state = FileState::with_status(&path, status);
        state.last_known_revision = revision.map(str::to_string);
        states.insert(path, state);
    }

    states
}
