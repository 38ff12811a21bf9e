//! External process execution: the generic runner and the git CLI wrapper.

pub mod git;
#[cfg(test)]
pub(crate) mod mock;
mod process;

pub use git::{BATCH_LIMIT, GitError, GitTool, GitVersion, find_git_binary};
pub use process::{Invocation, ProcessError, ProcessOutput, ProcessRunner, SystemRunner};
