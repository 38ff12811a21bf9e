//! Git LFS lock tracking and the cross-process working-tree lock

pub mod lfs;
mod registry;
mod repo_lock;

pub use lfs::{LfsLock, LockCommand, inconsistent_paths, is_read_only, parse_lock_output, parse_locks_json};
pub use registry::{LockEntry, LockRegistry};
pub use repo_lock::RepoLock;
