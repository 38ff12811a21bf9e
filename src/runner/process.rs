//! Process execution with captured, line-oriented output and a hard timeout.
//!
//! The runner is the only place in the crate that spawns child processes.
//! Everything above it talks to the [`ProcessRunner`] trait so the dispatcher
//! can be exercised against a scripted runner in tests.

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

/// How often a running child is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Errors returned by a process runner.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The binary could not be located or started.
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// The process did not finish in time and was killed.
    #[error("'{program}' timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    /// Waiting on the child failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single external command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            timeout,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Render the command line for logs.
    pub fn display(&self) -> String {
        let mut s = self.program.clone();
        for arg in &self.args {
            s.push(' ');
            s.push_str(arg);
        }
        s
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Build a successful output from stdout lines.
    pub fn ok<I, S>(stdout: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exit_code: 0,
            stdout_lines: stdout.into_iter().map(Into::into).collect(),
            stderr_lines: Vec::new(),
        }
    }

    /// Build a failed output from stderr lines.
    pub fn failed<I, S>(exit_code: i32, stderr: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exit_code,
            stdout_lines: Vec::new(),
            stderr_lines: stderr.into_iter().map(Into::into).collect(),
        }
    }

    /// First non-empty stderr line, else first non-empty stdout line.
    pub fn message(&self) -> String {
        self.stderr_lines
            .iter()
            .chain(self.stdout_lines.iter())
            .find(|l| !l.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| format!("exited with code {}", self.exit_code))
    }
}

/// Runs external processes.
pub trait ProcessRunner: Send + Sync {
    /// Run the invocation to completion or until its timeout expires.
    ///
    /// A non-zero exit is not an error at this layer; check
    /// [`ProcessOutput::success`].
    fn run(&self, invocation: &Invocation) -> Result<ProcessOutput, ProcessError>;
}

/// Runner backed by `std::process::Command`.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    poll_interval: Duration,
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemRunner {
    pub fn new() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
        }
    }
}

fn read_lines<R: Read>(reader: R) -> Vec<String> {
    let mut reader = BufReader::new(reader);
    let mut lines = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
                    buf.pop();
                }
                lines.push(String::from_utf8_lossy(&buf).into_owned());
            }
            Err(e) => {
                log::debug!("Stopped reading child output: {}", e);
                break;
            }
        }
    }
    lines
}

fn spawn_reader<R: Read + Send + 'static>(reader: Option<R>) -> Option<JoinHandle<Vec<String>>> {
    reader.map(|r| thread::spawn(move || read_lines(r)))
}

fn join_reader(handle: Option<JoinHandle<Vec<String>>>) -> Vec<String> {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

impl ProcessRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<ProcessOutput, ProcessError> {
        log::debug!("Running: {}", invocation.display());

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

        // Drain both pipes concurrently so a chatty child cannot block on a full pipe.
        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let start = Instant::now();
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None => {
                    if start.elapsed() >= invocation.timeout {
                        log::warn!(
                            "'{}' timed out after {:?}, killing process",
                            invocation.display(),
                            invocation.timeout
                        );
                        let _ = child.kill();
                        let _ = child.wait();
                        // Readers are left detached: a grandchild may still hold the pipes open.
                        return Err(ProcessError::Timeout {
                            program: invocation.program.clone(),
                            timeout: invocation.timeout,
                        });
                    }
                    thread::sleep(self.poll_interval);
                }
            }
        };

        Ok(ProcessOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout_lines: join_reader(stdout),
            stderr_lines: join_reader(stderr),
        })
    }
}
