use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;

use gitsc::provider::Settings;
use gitsc::{
    CacheUsage, FileState, FileStatus, InitOptions, Operation, OperationKind, OperationResult,
    Provider, ProviderEvent,
};

type CmdResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(
    name = "gitsc",
    about = "Git and Git LFS revision control for editor projects"
)]
struct Cli {
    /// Working tree root (defaults to the current directory)
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    /// Path to the git binary (defaults to git on PATH)
    #[arg(long, global = true)]
    git: Option<PathBuf>,

    /// Use Git LFS locking for check out
    #[arg(long, global = true)]
    lfs_locking: bool,

    /// Settings file (defaults to <config dir>/gitsc/settings.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the state of files (every changed file when no paths are given)
    Status {
        paths: Vec<String>,
        /// Include unmodified and ignored files
        #[arg(long)]
        all: bool,
        /// Print states as JSON
        #[arg(long)]
        json: bool,
    },

    /// Mark files for add
    Add {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Mark files for delete
    Rm {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Discard local changes
    Revert {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Commit files (everything staged when no paths are given)
    Commit {
        #[arg(short, long)]
        message: String,
        /// Push after committing
        #[arg(long)]
        push: bool,
        paths: Vec<String>,
    },

    /// Push the current branch
    Push,

    /// Pull and rebase the current branch
    Pull,

    /// Fetch from the remote
    Fetch,

    /// Lock files with Git LFS
    Lock {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Release Git LFS locks
    Unlock {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// List Git LFS locks
    Locks,

    /// Check lock state against read-only attributes
    Reconcile,

    /// Rename or move a file
    Mv { source: String, destination: String },

    /// Mark conflicted files as resolved
    Resolve {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Create a repository for a project
    Init {
        /// Remote URL to add
        #[arg(long)]
        remote: Option<String>,
        /// Track binary assets with Git LFS
        #[arg(long)]
        lfs: bool,
        /// Do not write a .gitignore
        #[arg(long)]
        no_ignore: bool,
        /// Skip the initial commit
        #[arg(long)]
        no_commit: bool,
        #[arg(short, long, default_value = "Initial commit")]
        message: String,
    },

    /// Run a raw git command through the operation queue
    Git {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },

    /// Fetch in the background and print state changes until Ctrl-C
    Watch {
        /// Seconds between background fetches
        #[arg(long, default_value_t = 30)]
        interval: u64,
    },

    /// Show provider and repository information
    Info,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let result = load_settings(&cli).and_then(|settings| run(cli.command, settings));

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        if e.to_string().contains("git not found") {
            eprintln!();
            eprintln!("Hint: Pass the git binary with: gitsc --git /path/to/git");
        }
        std::process::exit(1);
    }
}

fn load_settings(cli: &Cli) -> Result<Settings, Box<dyn std::error::Error>> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => Settings::default_path()?,
    };
    let mut settings = Settings::load(&path)?;

    if let Some(repo) = &cli.repo {
        settings.repository_root = Some(repo.clone());
    }
    if let Some(git) = &cli.git {
        settings.binary_path = Some(git.clone());
    }
    if cli.lfs_locking {
        settings.using_lfs_locking = true;
    }
    Ok(settings)
}

impl Commands {
    /// Resolve file arguments against `cwd`, so a path given from a
    /// subdirectory names the same file as one given from the root.
    fn resolve_paths(self, cwd: &Path) -> Self {
        let resolve = |paths: Vec<String>| -> Vec<String> {
            paths.iter().map(|p| from_dir(cwd, p)).collect()
        };
        match self {
            Commands::Status { paths, all, json } => Commands::Status {
                paths: resolve(paths),
                all,
                json,
            },
            Commands::Add { paths } => Commands::Add { paths: resolve(paths) },
            Commands::Rm { paths } => Commands::Rm { paths: resolve(paths) },
            Commands::Revert { paths } => Commands::Revert { paths: resolve(paths) },
            Commands::Commit {
                message,
                push,
                paths,
            } => Commands::Commit {
                message,
                push,
                paths: resolve(paths),
            },
            Commands::Lock { paths } => Commands::Lock { paths: resolve(paths) },
            Commands::Unlock { paths } => Commands::Unlock { paths: resolve(paths) },
            Commands::Mv {
                source,
                destination,
            } => Commands::Mv {
                source: from_dir(cwd, &source),
                destination: from_dir(cwd, &destination),
            },
            Commands::Resolve { paths } => Commands::Resolve { paths: resolve(paths) },
            other => other,
        }
    }
}

fn from_dir(cwd: &Path, path: &str) -> String {
    cwd.join(path).to_string_lossy().into_owned()
}

fn run(command: Commands, mut settings: Settings) -> CmdResult {
    let command = command.resolve_paths(&std::env::current_dir()?);

    // Only the watch loop fetches in the background.
    settings.auto_fetch_interval_secs = match &command {
        Commands::Watch { interval } => Some(*interval),
        _ => None,
    };
    let lockable = settings.using_lfs_locking;

    let provider = Provider::with_system_runner(settings);
    provider.start()?;

    let result = match command {
        Commands::Status { paths, all, json } => cmd_status(&provider, &paths, all, json),
        Commands::Add { paths } => cmd_simple(&provider, OperationKind::Add, &paths),
        Commands::Rm { paths } => cmd_simple(&provider, OperationKind::Delete, &paths),
        Commands::Revert { paths } => cmd_simple(&provider, OperationKind::Revert, &paths),
        Commands::Commit {
            message,
            push,
            paths,
        } => cmd_simple(&provider, OperationKind::Commit { message, push }, &paths),
        Commands::Push => cmd_simple(&provider, OperationKind::Push, &[]),
        Commands::Pull => cmd_simple(&provider, OperationKind::Pull, &[]),
        Commands::Fetch => cmd_simple(&provider, OperationKind::Fetch, &[]),
        Commands::Lock { paths } => cmd_lock(&provider, OperationKind::CheckOut, &paths),
        Commands::Unlock { paths } => cmd_lock(&provider, OperationKind::Unlock, &paths),
        Commands::Locks => cmd_locks(&provider),
        Commands::Reconcile => cmd_reconcile(&provider),
        Commands::Mv {
            source,
            destination,
        } => cmd_simple(&provider, OperationKind::Rename { destination }, &[source]),
        Commands::Resolve { paths } => cmd_simple(&provider, OperationKind::Resolve, &paths),
        Commands::Init {
            remote,
            lfs,
            no_ignore,
            no_commit,
            message,
        } => {
            let options = InitOptions {
                write_ignore: !no_ignore,
                write_attributes: lfs,
                use_lfs: lfs,
                lockable: lfs && lockable,
                remote_url: remote,
                initial_commit: (!no_commit).then_some(message),
            };
            cmd_init(&provider, options)
        }
        Commands::Git { args } => cmd_git(&provider, args),
        Commands::Watch { .. } => cmd_watch(&provider),
        Commands::Info => cmd_info(&provider),
    };

    provider.stop()?;
    result
}

/// Run `op` and turn a failed result into an error.
fn execute(provider: &Provider, op: Operation) -> Result<Operation, Box<dyn std::error::Error>> {
    let op = provider.execute_sync(op)?;
    match op.result {
        OperationResult::Succeeded => Ok(op),
        OperationResult::Cancelled => Err(format!("{} was cancelled", op.kind).into()),
        _ => {
            let messages = provider.last_errors();
            let messages = if messages.is_empty() {
                op.error_messages()
            } else {
                messages
            };
            Err(format!("{} failed: {}", op.kind, messages.join("\n  ")).into())
        }
    }
}

fn print_states(states: &[FileState]) {
    for state in states {
        let lock = match state.lock.other_owner() {
            Some(owner) => format!(" [locked by {}]", owner),
            None if state.lock.is_locked() => " [locked]".to_string(),
            None => String::new(),
        };
        println!("{:<12} {}{}", state.status.as_str(), state.path, lock);
    }
}

fn cmd_status(provider: &Provider, paths: &[String], all: bool, json: bool) -> CmdResult {
    let states = if paths.is_empty() {
        execute(provider, Operation::repository(OperationKind::UpdateStatus))?;
        provider.cached_states(|s| {
            all || !matches!(s.status, FileStatus::Unmodified | FileStatus::Ignored)
        })
    } else {
        provider.get_states(paths, CacheUsage::ForceUpdate)?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&states)?);
        return Ok(());
    }
    if states.is_empty() {
        println!("Nothing to report");
        return Ok(());
    }
    print_states(&states);
    Ok(())
}

fn cmd_simple(provider: &Provider, kind: OperationKind, paths: &[String]) -> CmdResult {
    let op = execute(provider, Operation::new(kind, paths))?;
    println!("{} done", op.kind);
    if !op.targets.is_empty() {
        print_states(&provider.get_states(&op.targets, CacheUsage::Use)?);
    }
    Ok(())
}

fn cmd_lock(provider: &Provider, kind: OperationKind, paths: &[String]) -> CmdResult {
    if !provider.settings().using_lfs_locking {
        return Err("LFS locking is disabled (pass --lfs-locking or enable it in settings)".into());
    }

    let op = execute(provider, Operation::new(kind, paths))?;
    for (path, outcome) in &op.path_outcomes {
        match outcome {
            Ok(()) => println!("{:<8} {}", "ok", path),
            Err(e) => println!("{:<8} {}", "failed", e),
        }
    }
    Ok(())
}

fn cmd_locks(provider: &Provider) -> CmdResult {
    if !provider.settings().using_lfs_locking {
        return Err("LFS locking is disabled (pass --lfs-locking or enable it in settings)".into());
    }

    execute(provider, Operation::repository(OperationKind::QueryLocks))?;
    let locks = provider.locks();
    if locks.is_empty() {
        println!("No locks");
        return Ok(());
    }

    let me = provider.lock_user();
    println!("{:<50} {:<20} {:>10}", "PATH", "OWNER", "ID");
    println!("{}", "-".repeat(82));
    for (path, entry) in locks {
        let owner = if !me.is_empty() && entry.owner == me {
            format!("{} (you)", entry.owner)
        } else {
            entry.owner.clone()
        };
        println!("{:<50} {:<20} {:>10}", path, owner, entry.id);
    }
    Ok(())
}

fn cmd_reconcile(provider: &Provider) -> CmdResult {
    if !provider.settings().using_lfs_locking {
        println!("LFS locking is disabled, nothing to reconcile");
        return Ok(());
    }

    let report = provider.reconcile()?;
    if report.inconsistent.is_empty() {
        println!("Lock state matches read-only attributes");
        return Ok(());
    }
    println!("{} paths disagree with their read-only attribute:", report.inconsistent.len());
    for path in &report.inconsistent {
        println!("  {}", path);
    }
    Ok(())
}

fn cmd_init(provider: &Provider, options: InitOptions) -> CmdResult {
    if provider.is_available() {
        return Err("a repository already exists here".into());
    }

    execute(provider, Operation::repository(OperationKind::Init(options)))?;
    match provider.repository() {
        Some(info) => println!("Initialized repository at {}", info.root.display()),
        None => println!("Initialized repository"),
    }
    Ok(())
}

fn cmd_git(provider: &Provider, args: Vec<String>) -> CmdResult {
    let op = provider.execute_sync(Operation::repository(OperationKind::Console { args }))?;
    for line in &op.output_lines {
        println!("{}", line);
    }
    if op.result != OperationResult::Succeeded {
        return Err(format!("git exited with an error: {}", op.error_messages().join("; ")).into());
    }
    Ok(())
}

fn cmd_watch(provider: &Provider) -> CmdResult {
    let running = Arc::new(AtomicBool::new(true));
    let handler = running.clone();
    ctrlc::set_handler(move || handler.store(false, Ordering::SeqCst))?;

    let events = provider.subscribe();
    execute(provider, Operation::repository(OperationKind::UpdateStatus))?;
    print_states(&provider.cached_states(|s| {
        !matches!(s.status, FileStatus::Unmodified | FileStatus::Ignored)
    }));
    println!("Watching for changes (Ctrl-C to stop)");

    while running.load(Ordering::SeqCst) {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(ProviderEvent::StateChanged { paths }) => {
                print_states(&provider.get_states(&paths, CacheUsage::Use)?);
            }
            Ok(ProviderEvent::OperationCompleted { id, kind, result }) => {
                log::debug!("{} #{} finished: {:?}", kind, id, result);
                if result == OperationResult::Failed {
                    for message in provider.last_errors() {
                        eprintln!("{}", message);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    provider.cancel_pending()?;
    println!("Stopped watching");
    Ok(())
}

fn cmd_info(provider: &Provider) -> CmdResult {
    print!("{}", provider.status_text());

    let caps = provider.capabilities();
    println!(
        "Check out: {}",
        if caps.uses_checkout { "LFS locks" } else { "not used" }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gitsc::repo_relative;
    use tempfile::tempdir;

    #[test]
    fn test_paths_from_subdirectory_are_repository_relative() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("Content/Maps")).unwrap();
        std::fs::write(root.join("Content/a.uasset"), "a").unwrap();

        let cwd = root.join("Content");
        let command = Commands::Add {
            paths: vec!["a.uasset".to_string(), "Maps".to_string()],
        }
        .resolve_paths(&cwd);
        let Commands::Add { paths } = command else {
            panic!("command changed kind");
        };
        let keys: Vec<String> = paths.iter().map(|p| repo_relative(root, p)).collect();
        assert_eq!(keys, vec!["Content/a.uasset", "Content/Maps"]);
    }

    #[test]
    fn test_mv_resolves_both_ends() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("Content")).unwrap();

        let command = Commands::Mv {
            source: "a.uasset".to_string(),
            destination: "b.uasset".to_string(),
        }
        .resolve_paths(&root.join("Content"));
        let Commands::Mv {
            source,
            destination,
        } = command
        else {
            panic!("command changed kind");
        };
        assert_eq!(repo_relative(root, &source), "Content/a.uasset");
        assert_eq!(repo_relative(root, &destination), "Content/b.uasset");
    }
}
