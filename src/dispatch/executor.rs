//! Runs one operation to completion on the worker thread.
//!
//! Each operation kind maps to one or more git invocations. Raw output is
//! appended to the operation, failures are classified into typed errors, and
//! the state cache and lock registry are updated from the parsed results.
//! Nothing here panics or returns `Err`: the outcome lives on the operation.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::operation::{
    InitOptions, Operation, OperationError, OperationKind, OperationResult, classify_failure,
};
use crate::cache::{
    FileStatus, LockState, RecentlyRefreshed, StateCache, parse_porcelain, states_for_batch,
};
use crate::locks::{
    LfsLock, LockCommand, LockRegistry, inconsistent_paths, parse_lock_output, parse_locks_json,
};
use crate::provider::bootstrap;
use crate::provider::repository::{RepositoryInfo, head_revision};
use crate::provider::settings::Settings;
use crate::runner::git::{batches, validate_argument, validate_git_ref};
use crate::runner::{GitTool, ProcessOutput};
use crate::util::{lock_recover, normalize_path, repo_relative};

const STATUS_ARGS: &[&str] = &[
    "status",
    "--porcelain=v1",
    "--untracked-files=all",
    "--ignored",
];

/// Per-provider knobs the executor needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub local_timeout: Duration,
    pub network_timeout: Duration,
    pub using_lfs_locking: bool,
    pub remote_name: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for ExecutorConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            local_timeout: settings.local_timeout(),
            network_timeout: settings.network_timeout(),
            using_lfs_locking: settings.using_lfs_locking,
            remote_name: settings.remote_name.clone(),
        }
    }
}

/// Shared state the executor reads and writes.
#[derive(Clone)]
pub struct ExecutorContext {
    pub cache: Arc<StateCache>,
    pub locks: Arc<LockRegistry>,
    pub recent: Arc<RecentlyRefreshed>,
    /// `None` until a repository is found (or created by init).
    pub repository: Arc<Mutex<Option<RepositoryInfo>>>,
}

pub struct Executor {
    git: GitTool,
    config: ExecutorConfig,
    ctx: ExecutorContext,
}

impl Executor {
    pub fn new(git: GitTool, config: ExecutorConfig, ctx: ExecutorContext) -> Self {
        Self { git, config, ctx }
    }

    pub fn git(&self) -> &GitTool {
        &self.git
    }

    fn is_connected(&self) -> bool {
        lock_recover(&self.ctx.repository).is_some()
    }

    fn timeout(&self, op: &Operation, network: bool) -> Duration {
        op.timeout.unwrap_or(if network {
            self.config.network_timeout
        } else {
            self.config.local_timeout
        })
    }

    /// Run the operation and set its terminal result. Returns the paths whose
    /// cached state changed.
    pub fn execute(&self, op: &mut Operation) -> Vec<String> {
        if !self.is_connected()
            && !matches!(op.kind, OperationKind::Init(_) | OperationKind::Console { .. })
        {
            op.fail(OperationError::NotConnected);
            return Vec::new();
        }
        self.make_relative(op);

        let kind = op.kind.clone();
        let mut changed = Vec::new();
        let ok = match &kind {
            OperationKind::UpdateStatus => {
                let targets = op.targets.clone();
                match self.refresh(op, &targets) {
                    Some(paths) => {
                        changed = paths;
                        true
                    }
                    None => false,
                }
            }
            OperationKind::Add => self.simple_batched(op, &["add"]),
            OperationKind::Delete => self.simple_batched(op, &["rm"]),
            OperationKind::Resolve => self.simple_batched(op, &["add"]),
            OperationKind::CheckOut => self.lock(op),
            OperationKind::Unlock => {
                let targets = op.targets.clone();
                self.unlock(op, &targets)
            }
            OperationKind::Revert => self.revert(op),
            OperationKind::Commit { message, push } => self.commit(op, message, *push),
            OperationKind::Push => self.push(op),
            OperationKind::Pull => self.pull(op),
            OperationKind::Fetch => self.fetch(op),
            OperationKind::Rename { destination } => self.rename(op, destination),
            OperationKind::Init(options) => self.init(op, options),
            OperationKind::Console { args } => self.console(op, args),
            OperationKind::QueryLocks => {
                let ok = self.query_locks(op);
                if ok {
                    changed = self.ctx.locks.states().into_keys().collect();
                }
                ok
            }
            OperationKind::Reconcile => {
                let ok = self.reconcile(op);
                changed = op.flagged.clone();
                ok
            }
        };

        if !ok {
            op.result = OperationResult::Failed;
            log::warn!(
                "{} #{} failed: {}",
                kind,
                op.id,
                op.error_messages().join("; ")
            );
            return changed;
        }

        op.result = OperationResult::Succeeded;
        if kind.refreshes_after() {
            changed.extend(self.refresh_after(op));
        }
        changed.sort();
        changed.dedup();
        changed
    }

    /// Key targets (and a rename destination) relative to the working tree.
    fn make_relative(&self, op: &mut Operation) {
        let root = self.git.root();
        for target in op.targets.iter_mut() {
            *target = repo_relative(root, target);
        }
        if let OperationKind::Rename { destination } = &mut op.kind {
            *destination = repo_relative(root, destination);
        }
    }

    fn run<S: AsRef<str>>(&self, op: &mut Operation, args: &[S], network: bool) -> Option<ProcessOutput> {
        match self.git.run(args, self.timeout(op, network)) {
            Ok(out) => {
                op.record(&out);
                Some(out)
            }
            Err(e) => {
                log::warn!("git invocation failed: {}", e);
                op.errors.push(e.into());
                None
            }
        }
    }

    /// Run and require a zero exit.
    fn run_ok<S: AsRef<str>>(&self, op: &mut Operation, args: &[S], network: bool) -> bool {
        match self.run(op, args, network) {
            Some(out) if out.success() => true,
            Some(out) => {
                let error = classify_failure(&op.kind, &out);
                op.errors.push(error);
                false
            }
            None => false,
        }
    }

    fn run_batched_ok(&self, op: &mut Operation, args: &[&str], paths: &[String], network: bool) -> bool {
        match self.git.run_batched(args, paths, self.timeout(op, network)) {
            Ok(outs) => {
                for out in &outs {
                    op.record(out);
                }
                match outs.last() {
                    Some(last) if !last.success() => {
                        let error = classify_failure(&op.kind, last);
                        op.errors.push(error);
                        false
                    }
                    _ => true,
                }
            }
            Err(e) => {
                op.errors.push(e.into());
                false
            }
        }
    }

    fn require_targets(op: &mut Operation) -> bool {
        if op.targets.is_empty() {
            let error = OperationError::InvalidRequest(format!("{} needs at least one path", op.kind));
            op.errors.push(error);
            return false;
        }
        true
    }

    fn simple_batched(&self, op: &mut Operation, args: &[&str]) -> bool {
        if !Self::require_targets(op) {
            return false;
        }
        let targets = op.targets.clone();
        self.run_batched_ok(op, args, &targets, false)
    }

    /// Query the status of `paths` (every cached path when empty), one
    /// invocation per batch. Cached files below a directory target are
    /// re-derived too. With LFS locking the lock list is fetched as well.
    /// Nothing is applied unless every invocation succeeded. Returns the
    /// refreshed paths.
    pub fn refresh(&self, op: &mut Operation, paths: &[String]) -> Option<Vec<String>> {
        let root = self.git.root().to_path_buf();
        let revision = head_revision(&root);
        let mut merged = BTreeMap::new();

        if paths.is_empty() {
            let out = self.run(op, STATUS_ARGS, false)?;
            if !out.success() {
                let error = classify_failure(&op.kind, &out);
                op.errors.push(error);
                return None;
            }
            let requested = self.ctx.cache.paths();
            merged = states_for_batch(
                &root,
                &requested,
                &parse_porcelain(&out.stdout_lines),
                revision.as_deref(),
            );
        } else {
            for batch in batches(paths) {
                let mut args: Vec<String> = STATUS_ARGS.iter().map(|s| s.to_string()).collect();
                args.push("--".to_string());
                args.extend(batch.iter().cloned());

                let out = self.run(op, &args, false)?;
                if !out.success() {
                    let error = classify_failure(&op.kind, &out);
                    op.errors.push(error);
                    return None;
                }

                let mut requested = batch.to_vec();
                for path in batch {
                    requested.extend(self.ctx.cache.paths_under(path));
                }
                merged.extend(states_for_batch(
                    &root,
                    &requested,
                    &parse_porcelain(&out.stdout_lines),
                    revision.as_deref(),
                ));
            }
        }

        let locks = if self.config.using_lfs_locking {
            Some(self.fetch_locks(op)?)
        } else {
            None
        };

        let refreshed: Vec<String> = merged.keys().cloned().collect();
        log::debug!("Refreshed {} paths", refreshed.len());
        self.ctx.cache.apply(merged);
        self.ctx.recent.mark(&refreshed);
        self.ctx.recent.mark(paths);
        if let Some(locks) = locks {
            self.apply_locks(locks);
        }
        Some(refreshed)
    }

    /// Status refresh after a successful operation. Failures only leave the
    /// targets stale; the operation itself already succeeded.
    fn refresh_after(&self, op: &mut Operation) -> Vec<String> {
        let mut paths = op.targets.clone();
        if let OperationKind::Rename { destination } = &op.kind {
            paths.push(normalize_path(destination));
        }
        if paths.is_empty() || op.kind.is_repository_wide() {
            paths.extend(self.ctx.cache.paths());
            paths.sort();
            paths.dedup();
        }
        if paths.is_empty() {
            return Vec::new();
        }

        let mut scratch = Operation::new(OperationKind::UpdateStatus, paths);
        scratch.timeout = op.timeout;
        let targets = scratch.targets.clone();
        let refreshed = self.refresh(&mut scratch, &targets);
        op.output_lines.append(&mut scratch.output_lines);

        match refreshed {
            Some(mut refreshed) => {
                refreshed.extend(op.targets.iter().cloned());
                refreshed
            }
            None => {
                log::warn!(
                    "Status refresh after {} #{} failed: {}",
                    op.kind,
                    op.id,
                    scratch.error_messages().join("; ")
                );
                op.targets.clone()
            }
        }
    }

    /// Replace the lock registry with `git lfs locks --json`.
    pub fn query_locks(&self, op: &mut Operation) -> bool {
        match self.fetch_locks(op) {
            Some(locks) => {
                self.apply_locks(locks);
                true
            }
            None => false,
        }
    }

    fn fetch_locks(&self, op: &mut Operation) -> Option<Vec<LfsLock>> {
        let out = self.run(op, &["lfs", "locks", "--json"], true)?;
        if !out.success() {
            let error = classify_failure(&OperationKind::QueryLocks, &out);
            op.errors.push(error);
            return None;
        }
        match parse_locks_json(&out.stdout_lines) {
            Ok(locks) => Some(locks),
            Err(e) => {
                op.errors.push(OperationError::ToolExit {
                    code: out.exit_code,
                    message: format!("unreadable lock list: {}", e),
                });
                None
            }
        }
    }

    fn apply_locks(&self, locks: Vec<LfsLock>) {
        log::debug!("LFS reports {} locks", locks.len());
        self.ctx.locks.replace_all(locks);
        self.ctx.cache.apply_locks(&self.ctx.locks.states());
    }

    fn lock(&self, op: &mut Operation) -> bool {
        if !Self::require_targets(op) {
            return false;
        }
        if !self.config.using_lfs_locking {
            log::info!("LFS locking is disabled, check out is a no-op");
            return true;
        }

        let mut to_lock = Vec::new();
        for path in op.targets.clone() {
            match self.ctx.locks.state(&path) {
                LockState::LockedByOther(owner) => {
                    op.path_outcomes.insert(
                        path.clone(),
                        Err(OperationError::LockDenied {
                            path,
                            owner: Some(owner),
                        }),
                    );
                }
                LockState::LockedByMe => {
                    op.path_outcomes.insert(path, Ok(()));
                }
                LockState::Unlocked => to_lock.push(path),
            }
        }

        self.run_lock_command(op, LockCommand::Lock, &to_lock);
        Self::settle_outcomes(op)
    }

    fn unlock(&self, op: &mut Operation, paths: &[String]) -> bool {
        if paths.is_empty() {
            return Self::require_targets(op);
        }
        if !self.config.using_lfs_locking {
            log::info!("LFS locking is disabled, unlock is a no-op");
            return true;
        }
        self.run_lock_command(op, LockCommand::Unlock, paths);
        Self::settle_outcomes(op)
    }

    fn run_lock_command(&self, op: &mut Operation, command: LockCommand, paths: &[String]) {
        let timeout = self.timeout(op, true);
        for batch in batches(paths) {
            let mut args = vec!["lfs".to_string(), command.subcommand().to_string(), "--".to_string()];
            args.extend(batch.iter().cloned());

            let outcomes = match self.git.run(&args, timeout) {
                Ok(out) => {
                    op.record(&out);
                    parse_lock_output(command, batch, &out)
                }
                Err(e) => {
                    let error = OperationError::from(e);
                    batch
                        .iter()
                        .map(|p| (p.clone(), Err(error.clone())))
                        .collect()
                }
            };

            for (path, outcome) in outcomes {
                if outcome.is_ok() {
                    match command {
                        LockCommand::Lock => {
                            self.ctx.locks.insert_mine(&path);
                            self.ctx.cache.set_lock(&path, LockState::LockedByMe);
                        }
                        LockCommand::Unlock => {
                            self.ctx.locks.remove(&path);
                            self.ctx.cache.set_lock(&path, LockState::Unlocked);
                        }
                    }
                }
                op.path_outcomes.insert(path, outcome);
            }
        }
    }

    /// Partial success: succeed when at least one path went through.
    fn settle_outcomes(op: &mut Operation) -> bool {
        let failures: Vec<OperationError> = op
            .path_outcomes
            .values()
            .filter_map(|r| r.as_ref().err().cloned())
            .collect();
        let any_ok = op.path_outcomes.values().any(|r| r.is_ok());
        op.errors.extend(failures);
        any_ok || op.path_outcomes.is_empty()
    }

    fn revert(&self, op: &mut Operation) -> bool {
        if !Self::require_targets(op) {
            return false;
        }

        let mut reset = Vec::new();
        let mut restore = Vec::new();
        for path in &op.targets {
            let state = self.ctx.cache.get(path);
            reset.push(path.clone());
            match state.status {
                // Newly added files become untracked again and stay on disk.
                FileStatus::Added | FileStatus::Untracked => {}
                FileStatus::Renamed => {
                    if let Some(from) = state.renamed_from {
                        reset.push(from.clone());
                        restore.push(from);
                    }
                }
                _ => restore.push(path.clone()),
            }
        }

        if !self.run_batched_ok(op, &["reset", "-q"], &reset, false) {
            return false;
        }
        if restore.is_empty() {
            return true;
        }
        self.run_batched_ok(op, &["checkout"], &restore, false)
    }

    fn commit(&self, op: &mut Operation, message: &str, push: bool) -> bool {
        if message.trim().is_empty() {
            op.errors
                .push(OperationError::InvalidRequest("commit message is empty".into()));
            return false;
        }

        let targets = op.targets.clone();
        if targets.is_empty() {
            if !self.run_ok(op, &["commit", "-m", message], false) {
                return false;
            }
        } else {
            // Large selections are committed in batches folded into one commit.
            for (i, batch) in batches(&targets).enumerate() {
                let mut args: Vec<String> = if i == 0 {
                    ["commit", "-m", message, "--only", "--"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect()
                } else {
                    ["commit", "--amend", "--no-edit", "--only", "--"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect()
                };
                args.extend(batch.iter().cloned());
                if !self.run_ok(op, &args, false) {
                    return false;
                }
            }
        }

        if !push {
            return true;
        }
        if !self.push(op) {
            return false;
        }

        if self.config.using_lfs_locking {
            let mine: Vec<String> = targets
                .into_iter()
                .filter(|p| self.ctx.locks.state(p) == LockState::LockedByMe)
                .collect();
            if !mine.is_empty() {
                log::info!("Releasing {} locks after push", mine.len());
                self.run_lock_command(op, LockCommand::Unlock, &mine);
            }
        }
        true
    }

    fn remote(&self, op: &mut Operation) -> Option<String> {
        let remote = self.config.remote_name.clone();
        match validate_git_ref(&remote, "remote name") {
            Ok(()) => Some(remote),
            Err(e) => {
                op.errors.push(e.into());
                None
            }
        }
    }

    fn push(&self, op: &mut Operation) -> bool {
        let Some(remote) = self.remote(op) else {
            return false;
        };
        self.run_ok(op, &["push", "--set-upstream", remote.as_str(), "HEAD"], true)
    }

    fn pull(&self, op: &mut Operation) -> bool {
        let Some(remote) = self.remote(op) else {
            return false;
        };
        let branch = lock_recover(&self.ctx.repository)
            .as_ref()
            .and_then(|r| r.branch.clone());

        let mut args = vec!["pull".to_string(), "--rebase".into(), "--autostash".into()];
        if let Some(branch) = branch {
            args.push(remote);
            args.push(branch);
        }
        self.run_ok(op, &args, true)
    }

    fn fetch(&self, op: &mut Operation) -> bool {
        let Some(remote) = self.remote(op) else {
            return false;
        };
        self.run_ok(op, &["fetch", remote.as_str()], true)
    }

    fn rename(&self, op: &mut Operation, destination: &str) -> bool {
        if op.targets.len() != 1 {
            op.errors.push(OperationError::InvalidRequest(format!(
                "rename needs exactly one source path, got {}",
                op.targets.len()
            )));
            return false;
        }
        let destination = normalize_path(destination);
        if let Err(e) = validate_argument(&destination, "destination") {
            op.errors.push(e.into());
            return false;
        }
        let source = op.targets[0].clone();
        if !self.run_ok(op, &["mv", "--", source.as_str(), destination.as_str()], false) {
            return false;
        }
        self.ctx.cache.remove(&source);
        true
    }

    fn init(&self, op: &mut Operation, options: &InitOptions) -> bool {
        let root: PathBuf = self.git.root().to_path_buf();
        if let Err(e) = std::fs::create_dir_all(&root) {
            op.errors.push(e.into());
            return false;
        }
        if !self.run_ok(op, &["init"], false) {
            return false;
        }

        let mut written = Vec::new();
        if options.write_ignore {
            match bootstrap::write_gitignore(&root) {
                Ok(_) => written.push(".gitignore".to_string()),
                Err(e) => {
                    op.errors.push(e.into());
                    return false;
                }
            }
        }
        if options.write_attributes {
            match bootstrap::write_gitattributes(&root, options.lockable) {
                Ok(_) => written.push(".gitattributes".to_string()),
                Err(e) => {
                    op.errors.push(e.into());
                    return false;
                }
            }
        }
        if options.use_lfs && !self.run_ok(op, &["lfs", "install", "--local"], false) {
            return false;
        }

        if let Some(url) = &options.remote_url {
            let Some(remote) = self.remote(op) else {
                return false;
            };
            if let Err(e) = validate_argument(url, "remote url") {
                op.errors.push(e.into());
                return false;
            }
            if !self.run_ok(op, &["remote", "add", remote.as_str(), url.as_str()], false) {
                return false;
            }
        }

        if let Some(message) = &options.initial_commit {
            let mut paths = written;
            paths.extend(op.targets.iter().cloned());
            if !paths.is_empty() && !self.run_batched_ok(op, &["add"], &paths, false) {
                return false;
            }
            if !self.run_ok(op, &["commit", "--allow-empty", "-m", message.as_str()], false) {
                return false;
            }
        }

        self.reconnect();
        true
    }

    /// Re-read repository information after the working tree changed shape.
    fn reconnect(&self) {
        let info = RepositoryInfo::discover(self.git.root(), &self.config.remote_name);
        match info {
            Ok(info) => {
                log::info!("Connected to repository at {}", info.root.display());
                *lock_recover(&self.ctx.repository) = Some(info);
            }
            Err(e) => log::warn!("Repository not readable after init: {}", e),
        }
    }

    fn console(&self, op: &mut Operation, args: &[String]) -> bool {
        if args.is_empty() {
            op.errors
                .push(OperationError::InvalidRequest("empty git command".into()));
            return false;
        }
        let ok = self.run_ok(op, args, true);
        if ok && args.first().map(String::as_str) == Some("init") {
            self.reconnect();
        }
        ok
    }

    /// Flag lock/read-only mismatches and re-query the server when any exist.
    fn reconcile(&self, op: &mut Operation) -> bool {
        if !self.config.using_lfs_locking {
            return true;
        }

        let mut candidates: HashMap<String, LockState> = self.ctx.locks.states();
        for state in self.ctx.cache.filter(|s| s.lock.is_locked()) {
            candidates.entry(state.path).or_insert(state.lock);
        }
        let flagged = inconsistent_paths(self.git.root(), candidates.iter());
        if flagged.is_empty() {
            return true;
        }

        log::warn!(
            "{} paths disagree with their read-only attribute, re-querying locks",
            flagged.len()
        );
        op.flagged = flagged;
        self.query_locks(op)
    }
}
