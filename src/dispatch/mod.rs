//! Operation queue, worker thread and background scheduler

use std::time::Duration;

pub mod executor;
mod operation;
pub mod scheduler;
pub mod worker;

pub use executor::{Executor, ExecutorConfig, ExecutorContext};
pub use operation::{
    InitOptions, Operation, OperationError, OperationId, OperationKind, OperationResult,
    classify_failure,
};
pub use scheduler::SchedulerHandle;
pub use worker::{Callback, Dispatcher, Shared, Submitter};

/// How long the worker waits for another process to release the working tree.
pub(crate) const REPO_LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
