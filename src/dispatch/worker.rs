//! Single worker thread that runs every operation.
//!
//! Callers enqueue operations on an unbounded channel; the worker dequeues
//! them in FIFO order and runs them one at a time, so at most one git process
//! is ever in flight. Synchronous callers wait on a oneshot reply; async
//! callers get their callback invoked on the worker thread once the caches
//! are updated.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as oneshot;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{Receiver, Sender, unbounded};
use dashmap::DashMap;

use super::executor::Executor;
use super::operation::{Operation, OperationId, OperationResult};
use crate::cache::{RecentlyRefreshed, StateCache};
use crate::locks::RepoLock;
use crate::provider::errors::{ErrorSink, ProviderError, messages_for};
use crate::provider::events::{EventBus, ProviderEvent};

/// Completion callback for asynchronous execution.
pub type Callback = Box<dyn FnOnce(Operation) + Send + 'static>;

/// How a finished operation is handed back.
pub enum Completion {
    /// A synchronous caller is waiting.
    Reply(oneshot::Sender<Operation>),
    Callback(Callback),
    /// Nobody is interested in the result.
    Detached,
}

impl Completion {
    fn complete(self, op: Operation) {
        match self {
            Completion::Reply(tx) => {
                let _ = tx.send(op);
            }
            Completion::Callback(callback) => callback(op),
            Completion::Detached => {}
        }
    }
}

/// Requests the worker can handle.
pub enum WorkerRequest {
    Run { op: Operation, completion: Completion },
    /// Stop the worker.
    Shutdown,
}

/// State shared between the worker and everyone submitting to it.
pub struct Shared {
    pub cache: Arc<StateCache>,
    pub recent: Arc<RecentlyRefreshed>,
    pub errors: Arc<ErrorSink>,
    pub events: Arc<EventBus>,
    /// Queued operation ids; the flag is set once the id is cancelled. The
    /// worker removes the entry when it dequeues the operation.
    pending: DashMap<OperationId, bool>,
    /// Id of the running operation, 0 when idle.
    running: AtomicU64,
    stopped: AtomicBool,
}

impl Shared {
    pub fn new(
        cache: Arc<StateCache>,
        recent: Arc<RecentlyRefreshed>,
        errors: Arc<ErrorSink>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            cache,
            recent,
            errors,
            events,
            pending: DashMap::new(),
            running: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    fn finish_cancelled(&self, mut op: Operation, completion: Completion) {
        self.pending.remove(&op.id);
        op.result = OperationResult::Cancelled;
        log::debug!("{} #{} cancelled before running", op.kind, op.id);
        self.events.publish(ProviderEvent::OperationCompleted {
            id: op.id,
            kind: op.kind.clone(),
            result: op.result,
        });
        completion.complete(op);
    }
}

/// The worker loop.
struct Worker {
    receiver: Receiver<WorkerRequest>,
    executor: Executor,
    shared: Arc<Shared>,
}

impl Worker {
    /// Run the worker loop (blocks until Shutdown).
    fn run(self) {
        log::info!("Worker thread started");

        loop {
            match self.receiver.recv() {
                Ok(WorkerRequest::Run { op, completion }) => self.handle(op, completion),
                Ok(WorkerRequest::Shutdown) => {
                    log::info!("Worker thread shutting down");
                    break;
                }
                Err(_) => {
                    log::info!("Worker channel closed, exiting");
                    break;
                }
            }
        }

        self.shared.stopped.store(true, Ordering::SeqCst);
        for request in self.receiver.try_iter() {
            if let WorkerRequest::Run { op, completion } = request {
                self.shared.finish_cancelled(op, completion);
            }
        }
    }

    fn handle(&self, mut op: Operation, completion: Completion) {
        let cancelled = self
            .shared
            .pending
            .remove(&op.id)
            .is_some_and(|(_, cancelled)| cancelled);
        if cancelled {
            self.shared.finish_cancelled(op, completion);
            return;
        }

        self.shared.running.store(op.id, Ordering::SeqCst);
        op.result = OperationResult::Running;
        log::debug!("Running {} #{} on {} paths", op.kind, op.id, op.targets.len());

        let changed = match RepoLock::path_for(self.executor.git().root()) {
            Some(lock_path) => {
                let wait = op.timeout.unwrap_or(super::REPO_LOCK_TIMEOUT);
                match RepoLock::acquire(&lock_path, wait) {
                    Ok(_guard) => self.executor.execute(&mut op),
                    Err(e) => {
                        log::warn!("Could not lock working tree: {}", e);
                        op.fail(e.into());
                        Vec::new()
                    }
                }
            }
            None => self.executor.execute(&mut op),
        };

        self.shared.running.store(0, Ordering::SeqCst);

        if op.result == OperationResult::Failed {
            self.shared.errors.set_last_errors(messages_for(&op));
        } else {
            self.shared.errors.clear();
        }
        log::info!("{} #{} finished: {:?}", op.kind, op.id, op.result);

        if !changed.is_empty() {
            self.shared
                .events
                .publish(ProviderEvent::StateChanged { paths: changed });
        }
        self.shared.events.publish(ProviderEvent::OperationCompleted {
            id: op.id,
            kind: op.kind.clone(),
            result: op.result,
        });
        completion.complete(op);
    }
}

/// Cloneable handle for submitting operations to the worker.
#[derive(Clone)]
pub struct Submitter {
    sender: Sender<WorkerRequest>,
    /// Clone of the worker's end, used to drain the queue on cancel.
    receiver: Receiver<WorkerRequest>,
    shared: Arc<Shared>,
    worker: ThreadId,
}

impl Submitter {
    /// Whether the calling thread is the worker thread.
    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.worker
    }

    fn enqueue(&self, mut op: Operation, completion: Completion) -> Result<OperationId, ProviderError> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(ProviderError::WorkerUnavailable);
        }
        let id = op.id;
        op.result = OperationResult::Pending;

        if op.kind.is_mutation() {
            if op.targets.is_empty() || op.kind.is_repository_wide() {
                self.shared.cache.invalidate_all();
                self.shared.recent.clear();
            } else {
                self.shared.cache.invalidate(&op.targets);
                self.shared.recent.forget(&op.targets);
            }
        }

        log::debug!("Queued {} #{}", op.kind, id);
        self.send(op, completion)
    }

    fn send(&self, op: Operation, completion: Completion) -> Result<OperationId, ProviderError> {
        let id = op.id;
        self.shared.pending.insert(id, false);
        self.sender
            .send(WorkerRequest::Run { op, completion })
            .map_err(|_| {
                self.shared.pending.remove(&id);
                ProviderError::WorkerUnavailable
            })?;

        // Shutdown may have drained the queue between the `stopped` check in
        // `enqueue` and this send; nobody else would complete the request.
        if self.shared.stopped.load(Ordering::SeqCst) {
            self.cancel_pending();
        }
        Ok(id)
    }

    /// Run `op` and block until it is terminal.
    pub fn submit_sync(&self, op: Operation) -> Result<Operation, ProviderError> {
        if self.is_worker_thread() {
            return Err(ProviderError::SyncFromWorker);
        }
        let (tx, rx) = oneshot::channel();
        self.enqueue(op, Completion::Reply(tx))?;
        rx.recv().map_err(|_| ProviderError::WorkerUnavailable)
    }

    /// Queue `op` and return immediately. The callback, if any, runs on the
    /// worker thread.
    pub fn submit_async(
        &self,
        op: Operation,
        callback: Option<Callback>,
    ) -> Result<OperationId, ProviderError> {
        let completion = match callback {
            Some(cb) => Completion::Callback(cb),
            None => Completion::Detached,
        };
        self.enqueue(op, completion)
    }

    /// Cancel one pending operation. A running (or unknown) operation is not
    /// affected; returns whether the cancel was recorded.
    pub fn cancel(&self, id: OperationId) -> bool {
        match self.shared.pending.get_mut(&id) {
            Some(mut cancelled) => {
                *cancelled = true;
                true
            }
            None => false,
        }
    }

    /// Complete every queued operation as `Cancelled` without running it.
    /// The running operation finishes normally. Callbacks of drained
    /// operations run on the calling thread.
    pub fn cancel_pending(&self) -> usize {
        let mut count = 0;
        let mut shutdown = false;
        for request in self.receiver.try_iter() {
            match request {
                WorkerRequest::Run { op, completion } => {
                    self.shared.finish_cancelled(op, completion);
                    count += 1;
                }
                WorkerRequest::Shutdown => shutdown = true,
            }
        }
        if shutdown {
            let _ = self.sender.send(WorkerRequest::Shutdown);
        }
        if count > 0 {
            log::info!("Cancelled {} pending operations", count);
        }
        count
    }

    /// Number of operations waiting in the queue.
    pub fn pending(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn running(&self) -> Option<OperationId> {
        match self.shared.running.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }
}

/// Owns the worker thread.
pub struct Dispatcher {
    submitter: Submitter,
    thread: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn the worker thread.
    pub fn spawn(executor: Executor, shared: Arc<Shared>) -> std::io::Result<Self> {
        let (sender, receiver) = unbounded();

        let worker = Worker {
            receiver: receiver.clone(),
            executor,
            shared: shared.clone(),
        };
        let thread = thread::Builder::new()
            .name("gitsc-worker".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            submitter: Submitter {
                sender,
                receiver,
                shared,
                worker: thread.thread().id(),
            },
            thread: Some(thread),
        })
    }

    pub fn submitter(&self) -> Submitter {
        self.submitter.clone()
    }

    pub fn submit_sync(&self, op: Operation) -> Result<Operation, ProviderError> {
        self.submitter.submit_sync(op)
    }

    pub fn submit_async(
        &self,
        op: Operation,
        callback: Option<Callback>,
    ) -> Result<OperationId, ProviderError> {
        self.submitter.submit_async(op, callback)
    }

    pub fn cancel(&self, id: OperationId) -> bool {
        self.submitter.cancel(id)
    }

    /// Complete every queued operation as `Cancelled` without running it.
    /// The running operation finishes normally.
    pub fn cancel_pending(&self) -> usize {
        self.submitter.cancel_pending()
    }

    /// Cancel pending work, stop the worker and wait for it.
    pub fn shutdown(&mut self) {
        self.submitter.shared.stopped.store(true, Ordering::SeqCst);
        self.cancel_pending();
        let _ = self.submitter.sender.send(WorkerRequest::Shutdown);
        if self.submitter.is_worker_thread() {
            // Joining ourselves would never return; the loop exits after this callback.
            self.thread.take();
            return;
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::executor::{ExecutorConfig, ExecutorContext};
    use crate::dispatch::operation::{OperationError, OperationKind};
    use crate::locks::LockRegistry;
    use crate::provider::repository::RepositoryInfo;
    use crate::runner::mock::ScriptedRunner;
    use crate::runner::{GitTool, ProcessOutput};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        runner: Arc<ScriptedRunner>,
        shared: Arc<Shared>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let cache = Arc::new(StateCache::new());
        let recent = Arc::new(RecentlyRefreshed::new());
        let ctx = ExecutorContext {
            cache: cache.clone(),
            locks: Arc::new(LockRegistry::new("alice")),
            recent: recent.clone(),
            repository: Arc::new(Mutex::new(Some(RepositoryInfo {
                root: dir.path().to_path_buf(),
                ..Default::default()
            }))),
        };
        let git = GitTool::new(runner.clone(), "git", dir.path());
        let executor = Executor::new(git, ExecutorConfig::default(), ctx);
        let shared = Arc::new(Shared::new(
            cache,
            recent,
            Arc::new(ErrorSink::new()),
            Arc::new(EventBus::new()),
        ));
        let dispatcher = Dispatcher::spawn(executor, shared.clone()).unwrap();
        Fixture {
            _dir: dir,
            runner,
            shared,
            dispatcher,
        }
    }

    fn add(path: &str) -> Operation {
        Operation::new(OperationKind::Add, [path])
    }

    #[test]
    fn test_spawn_and_shutdown() {
        let mut f = fixture();
        f.dispatcher.shutdown();
        // Double shutdown should be safe (no-op)
        f.dispatcher.shutdown();
        assert!(matches!(
            f.dispatcher.submit_sync(add("a.txt")),
            Err(ProviderError::WorkerUnavailable)
        ));
    }

    #[test]
    fn test_sync_returns_terminal_operation() {
        let f = fixture();
        let op = f.dispatcher.submit_sync(add("a.txt")).unwrap();
        assert_eq!(op.result, OperationResult::Succeeded);
        assert_eq!(f.runner.count_matching(&["add", "--", "a.txt"]), 1);
    }

    #[test]
    fn test_fifo_and_single_flight_under_concurrency() {
        let f = fixture();
        f.runner.set_delay(Duration::from_millis(5));
        let submitter = f.dispatcher.submitter();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let submitter = submitter.clone();
                std::thread::spawn(move || {
                    for i in 0..5 {
                        let op = submitter.submit_sync(add(&format!("t{}-{}.txt", t, i))).unwrap();
                        assert!(op.succeeded());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(f.runner.max_concurrency(), 1);
        // Per thread, adds ran in submission order.
        let adds: Vec<String> = f
            .runner
            .invocations()
            .into_iter()
            .filter(|inv| inv.args.contains(&"add".to_string()))
            .filter_map(|inv| inv.args.last().cloned())
            .filter(|p| p.starts_with("t0-"))
            .collect();
        assert_eq!(adds, vec!["t0-0.txt", "t0-1.txt", "t0-2.txt", "t0-3.txt", "t0-4.txt"]);
    }

    #[test]
    fn test_cancel_pending_leaves_running_operation() {
        let f = fixture();
        let release = f.runner.gate(&["add", "--", "a.txt"]);
        let started = f.runner.started();
        let (done_tx, done_rx) = unbounded();

        for path in ["a.txt", "b.txt", "c.txt"] {
            let done_tx = done_tx.clone();
            f.dispatcher
                .submit_async(add(path), Some(Box::new(move |op| {
                    let _ = done_tx.send((op.targets[0].clone(), op.result));
                })))
                .unwrap();
        }

        // Wait until A is running, then cancel the rest.
        let first = started.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(first.args.contains(&"a.txt".to_string()));
        assert_eq!(f.dispatcher.cancel_pending(), 2);
        drop(release);

        let mut results: Vec<(String, OperationResult)> = (0..3)
            .map(|_| done_rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        results.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            results,
            vec![
                ("a.txt".to_string(), OperationResult::Succeeded),
                ("b.txt".to_string(), OperationResult::Cancelled),
                ("c.txt".to_string(), OperationResult::Cancelled),
            ]
        );
        assert_eq!(f.runner.count_matching(&["b.txt"]), 0);
        assert_eq!(f.runner.count_matching(&["c.txt"]), 0);
    }

    #[test]
    fn test_cancel_by_id() {
        let f = fixture();
        let release = f.runner.gate(&["add", "--", "a.txt"]);
        let started = f.runner.started();
        let (done_tx, done_rx) = unbounded();

        let a = f.dispatcher.submit_async(add("a.txt"), None).unwrap();
        started.recv_timeout(Duration::from_secs(5)).unwrap();
        let b = f
            .dispatcher
            .submit_async(add("b.txt"), Some(Box::new(move |op| {
                let _ = done_tx.send(op.result);
            })))
            .unwrap();

        assert!(!f.dispatcher.cancel(a), "running operation cannot be cancelled");
        assert!(f.dispatcher.cancel(b));
        drop(release);

        assert_eq!(
            done_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            OperationResult::Cancelled
        );
        assert_eq!(f.runner.count_matching(&["b.txt"]), 0);
    }

    #[test]
    fn test_sync_from_worker_is_rejected() {
        let f = fixture();
        let submitter = f.dispatcher.submitter();
        let (tx, rx) = unbounded();

        f.dispatcher
            .submit_async(
                add("a.txt"),
                Some(Box::new(move |_| {
                    let nested = submitter.submit_sync(add("b.txt"));
                    let _ = tx.send(matches!(nested, Err(ProviderError::SyncFromWorker)));
                })),
            )
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_failure_reaches_error_sink_and_keeps_targets_stale() {
        let f = fixture();
        let mut seed = std::collections::BTreeMap::new();
        seed.insert(
            "a.txt".to_string(),
            crate::cache::FileState::with_status("a.txt", crate::cache::FileStatus::Modified),
        );
        f.shared.cache.apply(seed);
        f.runner.respond(
            &["commit"],
            ProcessOutput::failed(1, ["error: could not commit", "hint: nothing"]),
        );

        let op = f
            .dispatcher
            .submit_sync(Operation::new(
                OperationKind::Commit {
                    message: "wip".into(),
                    push: false,
                },
                ["a.txt"],
            ))
            .unwrap();

        assert_eq!(op.result, OperationResult::Failed);
        assert_eq!(f.shared.errors.last_errors(), vec!["error: could not commit"]);
        assert!(f.shared.cache.get("a.txt").stale);

        f.runner
            .respond(&["status"], ProcessOutput::ok([" M a.txt"]));
        let refresh = f
            .dispatcher
            .submit_sync(Operation::new(OperationKind::UpdateStatus, ["a.txt"]))
            .unwrap();
        assert!(refresh.succeeded());
        assert!(!f.shared.cache.get("a.txt").stale);
        assert!(f.shared.errors.last_errors().is_empty());
    }

    #[test]
    fn test_events_published() {
        let f = fixture();
        let events = f.shared.events.subscribe();
        f.dispatcher.submit_sync(add("a.txt")).unwrap();

        let received: Vec<ProviderEvent> = events.try_iter().collect();
        assert!(received
            .iter()
            .any(|e| matches!(e, ProviderEvent::StateChanged { paths } if paths.contains(&"a.txt".to_string()))));
        assert!(matches!(
            received.last(),
            Some(ProviderEvent::OperationCompleted {
                result: OperationResult::Succeeded,
                ..
            })
        ));
    }

    #[test]
    fn test_request_sent_after_shutdown_still_completes() {
        let mut f = fixture();
        let submitter = f.dispatcher.submitter();
        f.dispatcher.shutdown();

        // A caller that passed the stopped check just before shutdown.
        let (tx, rx) = unbounded();
        let op = add("late.txt");
        let id = op.id;
        submitter
            .send(op, Completion::Callback(Box::new(move |op| {
                let _ = tx.send(op.result);
            })))
            .unwrap();

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            OperationResult::Cancelled
        );
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(!submitter.cancel(id));
        assert_eq!(submitter.pending(), 0);
        assert_eq!(f.runner.count_matching(&["late.txt"]), 0);
    }

    #[test]
    fn test_cancel_after_dequeue_is_refused() {
        let f = fixture();
        let started = f.runner.started();
        let release = f.runner.gate(&["add", "--", "a.txt"]);

        let id = f.dispatcher.submit_async(add("a.txt"), None).unwrap();
        started.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(!f.dispatcher.cancel(id));
        assert_eq!(f.dispatcher.submitter().pending(), 0);
        drop(release);

        let op = f.dispatcher.submit_sync(add("b.txt")).unwrap();
        assert_eq!(op.result, OperationResult::Succeeded);
    }

    #[test]
    fn test_timeout_fails_operation_with_typed_error() {
        let f = fixture();
        f.runner.time_out(&["add"]);

        let op = f.dispatcher.submit_sync(add("a.txt")).unwrap();

        assert_eq!(op.result, OperationResult::Failed);
        assert!(op
            .errors
            .iter()
            .any(|e| matches!(e, OperationError::ProcessTimeout { .. })));
        // No output lines to filter, so the sink falls back to the typed message.
        let errors = f.shared.errors.last_errors();
        assert_eq!(errors, op.error_messages());
        assert!(errors[0].contains("timed out"), "{:?}", errors);
        assert!(f.shared.cache.get("a.txt").stale);
    }

    #[test]
    fn test_spawn_failure_fails_operation() {
        let f = fixture();
        f.runner.fail_spawn(&["rm"]);

        let op = f
            .dispatcher
            .submit_sync(Operation::new(OperationKind::Delete, ["a.txt"]))
            .unwrap();

        assert_eq!(op.result, OperationResult::Failed);
        assert!(matches!(
            op.errors.as_slice(),
            [OperationError::ProcessSpawn { .. }]
        ));
        assert_eq!(f.shared.errors.num_last_errors(), 1);
    }
}
