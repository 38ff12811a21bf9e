//! Provider facade: the single entry point a host application talks to.
//!
//! The provider owns the caches, the worker thread and the optional
//! background scheduler. Callers submit operations synchronously or with a
//! completion callback and read cached file state without ever touching the
//! git process themselves.

pub mod bootstrap;
pub mod errors;
pub mod events;
pub mod repository;
pub mod settings;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crossbeam_channel::Receiver;

pub use errors::{ErrorSink, ProviderError};
pub use events::{EventBus, HostCapabilities, ProviderEvent};
pub use repository::RepositoryInfo;
pub use settings::{Settings, SettingsError};

use crate::cache::{FileState, RecentlyRefreshed, StateCache};
use crate::dispatch::{
    Callback, Dispatcher, Executor, ExecutorConfig, ExecutorContext, Operation, OperationId,
    OperationKind, SchedulerHandle, Shared, Submitter,
};
use crate::locks::{LockEntry, LockRegistry};
use crate::runner::{GitError, GitTool, GitVersion, ProcessError, ProcessRunner, SystemRunner, find_git_binary};
use crate::util::{lock_recover, normalize_path, repo_relative};

/// How `execute` hands back the finished operation.
pub enum ExecutionMode {
    /// Block until the operation is terminal and return it.
    Sync,
    /// Return immediately; the callback (if any) runs on the worker thread.
    Async(Option<Callback>),
}

/// Whether `get_states` may answer from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUsage {
    Use,
    /// Query the tool first, unless the paths were refreshed moments ago.
    ForceUpdate,
}

/// Features the provider offers to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderCapabilities {
    pub uses_checkout: bool,
    pub uses_read_only_state: bool,
    pub uses_changelists: bool,
    pub uses_file_revisions: bool,
    pub allows_diff_against_depot: bool,
}

/// Paths whose lock state disagrees with their read-only attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub inconsistent: Vec<String>,
}

/// Threads and tool details that only exist while started.
struct Runtime {
    dispatcher: Dispatcher,
    scheduler: Option<SchedulerHandle>,
    binary: String,
    version: Option<GitVersion>,
    root: PathBuf,
}

pub struct Provider {
    settings: Settings,
    runner: Arc<dyn ProcessRunner>,
    errors: Arc<ErrorSink>,
    cache: Arc<StateCache>,
    locks: Arc<LockRegistry>,
    recent: Arc<RecentlyRefreshed>,
    events: Arc<EventBus>,
    repository: Arc<Mutex<Option<RepositoryInfo>>>,
    host: Mutex<HostCapabilities>,
    runtime: Mutex<Option<Runtime>>,
}

impl Provider {
    pub fn new(settings: Settings, runner: Arc<dyn ProcessRunner>) -> Self {
        let lock_user = settings.lock_user.clone().unwrap_or_default();
        Self {
            settings,
            runner,
            errors: Arc::new(ErrorSink::new()),
            cache: Arc::new(StateCache::new()),
            locks: Arc::new(LockRegistry::new(lock_user)),
            recent: Arc::new(RecentlyRefreshed::new()),
            events: Arc::new(EventBus::new()),
            repository: Arc::new(Mutex::new(None)),
            host: Mutex::new(HostCapabilities::default()),
            runtime: Mutex::new(None),
        }
    }

    /// Provider that runs the real `git` binary.
    pub fn with_system_runner(settings: Settings) -> Self {
        Self::new(settings, Arc::new(SystemRunner::new()))
    }

    /// Check the git binary, discover the repository and spawn the worker.
    ///
    /// A missing repository is not an error: the provider starts
    /// disconnected and only `Init` and `Console` operations can run.
    pub fn start(&self) -> Result<(), ProviderError> {
        let mut runtime = lock_recover(&self.runtime);
        if runtime.is_some() {
            return Err(ProviderError::AlreadyStarted);
        }

        let binary = match &self.settings.binary_path {
            Some(path) => path.display().to_string(),
            None => find_git_binary()
                .ok_or_else(|| ProviderError::GitNotFound("git is not on PATH".to_string()))?
                .display()
                .to_string(),
        };
        let requested_root = match &self.settings.repository_root {
            Some(root) => root.clone(),
            None => std::env::current_dir()?,
        };

        // The probe needs an existing cwd; init may target a directory that
        // does not exist yet.
        let probe_dir = if requested_root.is_dir() {
            requested_root.clone()
        } else {
            std::env::temp_dir()
        };
        let probe = GitTool::new(self.runner.clone(), binary.as_str(), probe_dir);
        let version = match probe.version(self.settings.local_timeout()) {
            Ok(version) => version,
            Err(GitError::Process(ProcessError::Spawn { .. })) => {
                return Err(ProviderError::GitNotFound(binary));
            }
            Err(e) => {
                log::warn!("Could not read git version: {}", e);
                None
            }
        };
        match &version {
            Some(v) => log::info!("Using {} ({})", binary, v),
            None => log::info!("Using {} (unknown version)", binary),
        }

        let info = match RepositoryInfo::discover(&requested_root, &self.settings.remote_name) {
            Ok(info) => {
                log::info!(
                    "Repository at {} on branch {}",
                    info.root.display(),
                    info.branch.as_deref().unwrap_or("(detached)")
                );
                Some(info)
            }
            Err(e) => {
                log::warn!(
                    "No repository at {} ({}), only init is available",
                    requested_root.display(),
                    e.message()
                );
                None
            }
        };
        let root = info
            .as_ref()
            .map(|i| i.root.clone())
            .unwrap_or(requested_root);

        if self.settings.lock_user.is_none()
            && let Some(name) = info.as_ref().and_then(|i| i.user_name.clone())
        {
            self.locks.set_user(name);
        }
        let connected = info.is_some();
        *lock_recover(&self.repository) = info;

        let executor = Executor::new(
            GitTool::new(self.runner.clone(), binary.as_str(), root.clone()),
            ExecutorConfig::from(&self.settings),
            ExecutorContext {
                cache: self.cache.clone(),
                locks: self.locks.clone(),
                recent: self.recent.clone(),
                repository: self.repository.clone(),
            },
        );
        let shared = Arc::new(Shared::new(
            self.cache.clone(),
            self.recent.clone(),
            self.errors.clone(),
            self.events.clone(),
        ));
        let dispatcher = Dispatcher::spawn(executor, shared)?;

        let scheduler = match self.settings.auto_fetch_interval() {
            Some(interval) if connected => {
                Some(SchedulerHandle::spawn(dispatcher.submitter(), interval)?)
            }
            _ => None,
        };

        *runtime = Some(Runtime {
            dispatcher,
            scheduler,
            binary,
            version,
            root,
        });
        log::info!("Provider started");
        Ok(())
    }

    /// Cancel queued work, join the threads and clear every cache.
    pub fn stop(&self) -> Result<(), ProviderError> {
        let runtime = lock_recover(&self.runtime).take();
        let Some(mut runtime) = runtime else {
            return Err(ProviderError::NotStarted);
        };

        if let Some(mut scheduler) = runtime.scheduler.take() {
            scheduler.shutdown();
        }
        runtime.dispatcher.shutdown();

        self.cache.clear();
        self.recent.clear();
        self.locks.clear();
        self.errors.clear();
        *lock_recover(&self.repository) = None;
        log::info!("Provider stopped");
        Ok(())
    }

    /// Submitter for the running worker. The runtime lock is released before
    /// anything is submitted, so callbacks may call back into the provider.
    fn submitter(&self) -> Result<Submitter, ProviderError> {
        lock_recover(&self.runtime)
            .as_ref()
            .map(|r| r.dispatcher.submitter())
            .ok_or(ProviderError::NotStarted)
    }

    /// Run `op` in the given mode. `Sync` returns the finished operation,
    /// `Async` returns `None` once queued.
    pub fn execute(&self, op: Operation, mode: ExecutionMode) -> Result<Option<Operation>, ProviderError> {
        let submitter = self.submitter()?;
        let op = self.keyed(op);
        match mode {
            ExecutionMode::Sync => submitter.submit_sync(op).map(Some),
            ExecutionMode::Async(callback) => submitter.submit_async(op, callback).map(|_| None),
        }
    }

    pub fn execute_sync(&self, op: Operation) -> Result<Operation, ProviderError> {
        self.submitter()?.submit_sync(self.keyed(op))
    }

    pub fn execute_async(&self, op: Operation, callback: Option<Callback>) -> Result<OperationId, ProviderError> {
        self.submitter()?.submit_async(self.keyed(op), callback)
    }

    /// `op` with its targets keyed like the cache, so queue-time
    /// invalidation hits the same records the refresh later writes.
    fn keyed(&self, mut op: Operation) -> Operation {
        op.targets = op.targets.iter().map(|p| self.key(p)).collect();
        if let OperationKind::Rename { destination } = &mut op.kind {
            *destination = self.key(destination);
        }
        op
    }

    /// Refresh the status of `paths`; every cached path when empty.
    pub fn refresh(&self, paths: &[String]) -> Result<Operation, ProviderError> {
        self.execute_sync(Operation::new(OperationKind::UpdateStatus, paths))
    }

    pub fn refresh_async(&self, paths: &[String], callback: Option<Callback>) -> Result<OperationId, ProviderError> {
        self.execute_async(Operation::new(OperationKind::UpdateStatus, paths), callback)
    }

    /// Cache key for a caller path: absolute paths inside the working tree
    /// become relative to it.
    fn key(&self, path: &str) -> String {
        let runtime = lock_recover(&self.runtime);
        let root = runtime
            .as_ref()
            .map(|r| r.root.as_path())
            .or(self.settings.repository_root.as_deref());
        match root {
            Some(root) => repo_relative(root, path),
            None => normalize_path(path),
        }
    }

    /// Cached state of `path`; `Unknown` if it was never refreshed.
    pub fn get_state(&self, path: &str) -> FileState {
        self.cache.get(&self.key(path))
    }

    /// States of `paths`, refreshing them first with `ForceUpdate`.
    pub fn get_states(&self, paths: &[String], usage: CacheUsage) -> Result<Vec<FileState>, ProviderError> {
        let paths: Vec<String> = paths.iter().map(|p| self.key(p)).collect();
        if usage == CacheUsage::ForceUpdate {
            if self.recent.contains_all(&paths) {
                log::debug!("{} paths refreshed moments ago, using cache", paths.len());
            } else {
                let op = self.refresh(&paths)?;
                if !op.succeeded() {
                    log::warn!("Forced refresh failed: {}", op.error_messages().join("; "));
                }
            }
        }
        Ok(paths.iter().map(|p| self.cache.get(p)).collect())
    }

    /// Every cached state matching `predicate`, sorted by path.
    pub fn cached_states<F>(&self, predicate: F) -> Vec<FileState>
    where
        F: Fn(&FileState) -> bool,
    {
        self.cache.filter(predicate)
    }

    pub fn remove_from_cache(&self, path: &str) -> bool {
        self.cache.remove(&self.key(path))
    }

    pub fn last_errors(&self) -> Vec<String> {
        self.errors.last_errors()
    }

    pub fn num_last_errors(&self) -> usize {
        self.errors.num_last_errors()
    }

    /// Report errors out of band, replacing the last command's.
    pub fn set_last_errors(&self, messages: Vec<String>) {
        self.errors.set_last_errors(messages);
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn repository(&self) -> Option<RepositoryInfo> {
        lock_recover(&self.repository).clone()
    }

    pub fn git_version(&self) -> Option<GitVersion> {
        lock_recover(&self.runtime)
            .as_ref()
            .and_then(|r| r.version.clone())
    }

    pub fn capabilities(&self) -> ProviderCapabilities {
        let locking = self.settings.using_lfs_locking;
        ProviderCapabilities {
            uses_checkout: locking,
            uses_read_only_state: locking,
            uses_changelists: false,
            uses_file_revisions: true,
            allows_diff_against_depot: true,
        }
    }

    /// Started; the worker accepts operations.
    pub fn is_enabled(&self) -> bool {
        lock_recover(&self.runtime).is_some()
    }

    /// Started and bound to a repository.
    pub fn is_available(&self) -> bool {
        self.is_enabled() && lock_recover(&self.repository).is_some()
    }

    /// Multi-line summary for a status panel.
    pub fn status_text(&self) -> String {
        let runtime = lock_recover(&self.runtime);
        let Some(runtime) = runtime.as_ref() else {
            return "Enabled: no\n".to_string();
        };

        let mut text = String::from("Enabled: yes\n");
        let version = runtime
            .version
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unknown version".to_string());
        text.push_str(&format!("Git: {} ({})\n", runtime.binary, version));

        match lock_recover(&self.repository).as_ref() {
            Some(info) => {
                text.push_str(&format!("Repository: {}\n", info.root.display()));
                let branch = info.branch.as_deref().unwrap_or("(detached)");
                match &info.upstream {
                    Some(upstream) => text.push_str(&format!("Branch: {} ({})\n", branch, upstream)),
                    None => text.push_str(&format!("Branch: {}\n", branch)),
                }
                if let Some(url) = &info.remote_url {
                    text.push_str(&format!("Remote: {}\n", url));
                }
                if let Some(name) = &info.user_name {
                    match &info.user_email {
                        Some(email) => text.push_str(&format!("User: {} <{}>\n", name, email)),
                        None => text.push_str(&format!("User: {}\n", name)),
                    }
                }
            }
            None => {
                text.push_str(&format!("Repository: none at {}\n", runtime.root.display()));
            }
        }

        if self.settings.using_lfs_locking {
            text.push_str(&format!("LFS locking: enabled as {}\n", self.locks.user()));
        } else {
            text.push_str("LFS locking: disabled\n");
        }
        text
    }

    pub fn subscribe(&self) -> Receiver<ProviderEvent> {
        self.events.subscribe()
    }

    /// Declare which optional hooks the host supports.
    pub fn register_host(&self, capabilities: HostCapabilities) {
        self.events.set_state_events(capabilities.state_change_events);
        *lock_recover(&self.host) = capabilities;
    }

    pub fn host_capabilities(&self) -> HostCapabilities {
        *lock_recover(&self.host)
    }

    /// The host selected `paths`. Queues a background refresh if the host
    /// asked for one and the paths are not fresh already.
    pub fn on_selection(&self, paths: &[String]) -> Result<Option<OperationId>, ProviderError> {
        if !lock_recover(&self.host).refresh_on_selection {
            return Ok(None);
        }
        let paths: Vec<String> = paths.iter().map(|p| self.key(p)).collect();
        if paths.is_empty() || self.recent.contains_all(&paths) {
            return Ok(None);
        }
        self.refresh_async(&paths, None).map(Some)
    }

    /// Cancel every queued operation; the running one finishes.
    pub fn cancel_pending(&self) -> Result<usize, ProviderError> {
        Ok(self.submitter()?.cancel_pending())
    }

    /// Cancel one queued operation. Returns false if it is running or gone.
    pub fn cancel(&self, id: OperationId) -> Result<bool, ProviderError> {
        Ok(self.submitter()?.cancel(id))
    }

    /// Replace the lock registry with the server's view.
    pub fn query_locks(&self) -> Result<Operation, ProviderError> {
        self.execute_sync(Operation::repository(OperationKind::QueryLocks))
    }

    /// Compare lock state with read-only attributes, re-querying the server
    /// when they disagree.
    pub fn reconcile(&self) -> Result<ReconcileReport, ProviderError> {
        let op = self.execute_sync(Operation::repository(OperationKind::Reconcile))?;
        if !op.succeeded() {
            log::warn!("Reconcile failed: {}", op.error_messages().join("; "));
        }
        Ok(ReconcileReport {
            inconsistent: op.flagged,
        })
    }

    /// Known LFS locks, sorted by path.
    pub fn locks(&self) -> Vec<(String, LockEntry)> {
        self.locks.entries()
    }

    pub fn lock_user(&self) -> String {
        self.locks.user()
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{FileStatus, LockState};
    use crate::dispatch::OperationResult;
    use crate::runner::ProcessOutput;
    use crate::runner::mock::ScriptedRunner;
    use git2::Repository;
    use std::path::Path;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    fn settings(root: &Path, lfs: bool) -> Settings {
        Settings {
            binary_path: Some(PathBuf::from("git")),
            repository_root: Some(root.to_path_buf()),
            using_lfs_locking: lfs,
            lock_user: Some("alice".to_string()),
            auto_fetch_interval_secs: None,
            ..Default::default()
        }
    }

    fn runner() -> Arc<ScriptedRunner> {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(&["version"], ProcessOutput::ok(["git version 2.43.0"]));
        runner
    }

    fn started(lfs: bool) -> (TempDir, Arc<ScriptedRunner>, Provider) {
        let dir = tempdir().unwrap();
        Repository::init(dir.path()).unwrap();
        let runner = runner();
        let provider = Provider::new(settings(dir.path(), lfs), runner.clone());
        provider.start().unwrap();
        (dir, runner, provider)
    }

    fn paths(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_operations_require_start() {
        let dir = tempdir().unwrap();
        let provider = Provider::new(settings(dir.path(), false), runner());

        assert!(!provider.is_enabled());
        assert!(matches!(provider.refresh(&[]), Err(ProviderError::NotStarted)));
        assert!(matches!(provider.stop(), Err(ProviderError::NotStarted)));
        assert!(matches!(provider.cancel_pending(), Err(ProviderError::NotStarted)));
    }

    #[test]
    fn test_start_twice_and_stop_clears_cache() {
        let (dir, runner, provider) = started(false);
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        runner.respond(&["status"], ProcessOutput::ok([" M a.txt"]));

        assert!(matches!(provider.start(), Err(ProviderError::AlreadyStarted)));
        assert!(provider.is_available());
        provider.refresh(&paths(&["a.txt"])).unwrap();
        assert_eq!(provider.get_state("a.txt").status, FileStatus::Modified);

        provider.stop().unwrap();
        assert!(!provider.is_enabled());
        assert_eq!(provider.get_state("a.txt").status, FileStatus::Unknown);
        assert_eq!(provider.repository(), None);
    }

    #[test]
    fn test_missing_git_binary() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail_spawn(&["version"]);
        let provider = Provider::new(settings(dir.path(), false), runner);

        assert!(matches!(provider.start(), Err(ProviderError::GitNotFound(_))));
        assert!(!provider.is_enabled());
    }

    #[test]
    fn test_refresh_reflects_porcelain() {
        let (dir, runner, provider) = started(false);
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        runner.respond(&["status"], ProcessOutput::ok([" M a.txt", "?? b.txt"]));

        let op = provider.refresh(&paths(&["a.txt", "b.txt"])).unwrap();
        assert_eq!(op.result, OperationResult::Succeeded);

        let states = provider
            .get_states(&paths(&["a.txt", "b.txt"]), CacheUsage::Use)
            .unwrap();
        assert_eq!(states[0].status, FileStatus::Modified);
        assert_eq!(states[1].status, FileStatus::Untracked);
        assert!(states.iter().all(|s| !s.stale));
    }

    #[test]
    fn test_absolute_paths_share_the_relative_record() {
        let (dir, runner, provider) = started(false);
        std::fs::write(dir.path().join("a.uasset"), "a").unwrap();
        runner.respond(&["status"], ProcessOutput::ok([" M a.uasset"]));
        let abs = dir.path().join("a.uasset").to_string_lossy().into_owned();

        let states = provider
            .get_states(&[abs.clone()], CacheUsage::ForceUpdate)
            .unwrap();
        assert_eq!(states[0].path, "a.uasset");
        assert_eq!(states[0].status, FileStatus::Modified);
        assert_eq!(provider.get_state(&abs), provider.get_state("a.uasset"));
        assert_eq!(provider.cached_states(|_| true).len(), 1);
    }

    #[test]
    fn test_consecutive_refreshes_are_identical() {
        let (dir, runner, provider) = started(false);
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("c.txt"), "c").unwrap();
        runner.respond(&["status"], ProcessOutput::ok([" M a.txt"]));
        let targets = paths(&["a.txt", "c.txt"]);

        provider.refresh(&targets).unwrap();
        let first = provider.get_states(&targets, CacheUsage::Use).unwrap();
        provider.refresh(&targets).unwrap();
        let second = provider.get_states(&targets, CacheUsage::Use).unwrap();

        assert_eq!(first, second);
        assert_eq!(second[1].status, FileStatus::Unmodified);
    }

    #[test]
    fn test_failed_commit_stays_stale_until_refresh() {
        let (dir, runner, provider) = started(false);
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        runner.respond(&["status"], ProcessOutput::ok([" M a.txt"]));
        runner.respond(
            &["commit"],
            ProcessOutput::failed(1, ["error: unable to write new index file"]),
        );
        provider.refresh(&paths(&["a.txt"])).unwrap();

        let commit = Operation::new(
            OperationKind::Commit {
                message: "update".to_string(),
                push: false,
            },
            ["a.txt"],
        );
        let op = provider.execute_sync(commit).unwrap();
        assert_eq!(op.result, OperationResult::Failed);
        assert!(provider.get_state("a.txt").stale);
        assert_eq!(provider.num_last_errors(), 1);

        provider.refresh(&paths(&["a.txt"])).unwrap();
        let state = provider.get_state("a.txt");
        assert!(!state.stale);
        assert_eq!(state.status, FileStatus::Modified);
        // A successful operation clears the sink.
        assert_eq!(provider.num_last_errors(), 0);
    }

    #[test]
    fn test_force_update_skips_recently_refreshed_paths() {
        let (dir, runner, provider) = started(false);
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        runner.respond(&["status"], ProcessOutput::ok(["A  a.txt"]));

        let op = provider
            .execute_sync(Operation::new(OperationKind::Add, ["a.txt"]))
            .unwrap();
        assert!(op.succeeded());
        let before = runner.count_matching(&["status"]);

        let states = provider
            .get_states(&paths(&["a.txt"]), CacheUsage::ForceUpdate)
            .unwrap();
        assert_eq!(states[0].status, FileStatus::Added);
        assert_eq!(runner.count_matching(&["status"]), before);

        provider
            .get_states(&paths(&["other.txt"]), CacheUsage::ForceUpdate)
            .unwrap();
        assert_eq!(runner.count_matching(&["status"]), before + 1);
    }

    #[test]
    fn test_async_callback_and_sync_from_worker() {
        let (_dir, runner, provider) = started(false);
        runner.respond(&["status"], ProcessOutput::ok(Vec::<String>::new()));
        let provider = Arc::new(provider);

        let (tx, rx) = mpsc::channel();
        let inner = provider.clone();
        provider
            .execute(
                Operation::repository(OperationKind::UpdateStatus),
                ExecutionMode::Async(Some(Box::new(move |op| {
                    let nested = inner.refresh(&[]);
                    let _ = tx.send((op.result, matches!(nested, Err(ProviderError::SyncFromWorker))));
                }))),
            )
            .unwrap();

        let (result, rejected) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result, OperationResult::Succeeded);
        assert!(rejected);
        provider.stop().unwrap();
    }

    #[test]
    fn test_not_connected_outside_repository() {
        let dir = tempdir().unwrap();
        if Repository::discover(dir.path()).is_ok() {
            return;
        }
        let runner = runner();
        let provider = Provider::new(settings(dir.path(), false), runner.clone());
        provider.start().unwrap();

        assert!(provider.is_enabled());
        assert!(!provider.is_available());
        assert!(provider.status_text().contains("Repository: none"));

        let op = provider
            .execute_sync(Operation::new(OperationKind::Add, ["a.txt"]))
            .unwrap();
        assert_eq!(op.result, OperationResult::Failed);
        assert_eq!(runner.count_matching(&["add"]), 0);
    }

    #[test]
    fn test_host_without_state_events() {
        let (_dir, runner, provider) = started(false);
        runner.respond(&["status"], ProcessOutput::ok(Vec::<String>::new()));
        let events = provider.subscribe();

        provider.register_host(HostCapabilities {
            state_change_events: false,
            refresh_on_selection: true,
        });
        provider.refresh(&paths(&["a.txt"])).unwrap();

        let received: Vec<ProviderEvent> = events.try_iter().collect();
        assert_eq!(received.len(), 1);
        assert!(matches!(received[0], ProviderEvent::OperationCompleted { .. }));

        // Fresh paths do not trigger another refresh on selection.
        assert_eq!(provider.on_selection(&paths(&["a.txt"])).unwrap(), None);
        assert!(provider.on_selection(&paths(&["b.txt"])).unwrap().is_some());
    }

    #[test]
    fn test_capabilities_and_status_text_follow_locking() {
        let (_dir, runner, provider) = started(true);
        runner.respond(&["lfs", "locks"], ProcessOutput::ok(["[]"]));

        let caps = provider.capabilities();
        assert!(caps.uses_checkout);
        assert!(caps.uses_read_only_state);
        assert!(!caps.uses_changelists);

        let text = provider.status_text();
        assert!(text.contains("Enabled: yes"));
        assert!(text.contains("Git: git (2.43.0)"));
        assert!(text.contains("LFS locking: enabled as alice"));

        let report = provider.reconcile().unwrap();
        assert!(report.inconsistent.is_empty());
        assert_eq!(provider.get_state("x").lock, LockState::Unlocked);
    }
}
