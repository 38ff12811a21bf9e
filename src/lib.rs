//! Asynchronous Git / Git LFS revision-control provider

pub mod cache;
pub mod dispatch;
pub mod locks;
pub mod provider;
pub mod runner;
mod util;

pub use cache::{FileState, FileStatus, LockState};
pub use dispatch::{InitOptions, Operation, OperationError, OperationId, OperationKind, OperationResult};
pub use provider::{
    CacheUsage, ExecutionMode, HostCapabilities, Provider, ProviderCapabilities, ProviderError,
    ProviderEvent, ReconcileReport, Settings,
};
pub use util::{normalize_path, repo_relative};
