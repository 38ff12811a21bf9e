//! Scripted process runner for tests.
//!
//! Responses are keyed by an argument pattern: a rule matches when its
//! pattern appears as a contiguous run inside the invocation's arguments.
//! Rules are checked in insertion order; unmatched invocations succeed with
//! empty output. Every invocation is recorded.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};

use super::process::{Invocation, ProcessError, ProcessOutput, ProcessRunner};
use crate::util::lock_recover;

#[derive(Debug, Clone)]
enum Response {
    Output(ProcessOutput),
    SpawnError,
    Timeout,
}

#[derive(Debug)]
struct Rule {
    pattern: Vec<String>,
    response: Response,
    once: bool,
}

struct Gate {
    pattern: Vec<String>,
    release: Receiver<()>,
}

/// Process runner returning pre-programmed output.
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    gates: Mutex<Vec<Gate>>,
    history: Mutex<Vec<Invocation>>,
    started_tx: Sender<Invocation>,
    started_rx: Receiver<Invocation>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn to_pattern(pattern: &[&str]) -> Vec<String> {
    pattern.iter().map(|s| s.to_string()).collect()
}

fn matches(pattern: &[String], args: &[String]) -> bool {
    if pattern.is_empty() {
        return true;
    }
    args.windows(pattern.len()).any(|w| w == pattern)
}

impl ScriptedRunner {
    pub fn new() -> Self {
        let (started_tx, started_rx) = unbounded();
        Self {
            rules: Mutex::new(Vec::new()),
            gates: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            started_tx,
            started_rx,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay: Mutex::new(None),
        }
    }

    fn push_rule(&self, pattern: &[&str], response: Response, once: bool) {
        lock_recover(&self.rules).push(Rule {
            pattern: to_pattern(pattern),
            response,
            once,
        });
    }

    /// Always answer invocations matching `pattern` with `output`.
    pub fn respond(&self, pattern: &[&str], output: ProcessOutput) {
        self.push_rule(pattern, Response::Output(output), false);
    }

    /// Answer the next matching invocation with `output`, then forget the rule.
    pub fn respond_once(&self, pattern: &[&str], output: ProcessOutput) {
        self.push_rule(pattern, Response::Output(output), true);
    }

    /// Matching invocations fail as if the binary were missing.
    pub fn fail_spawn(&self, pattern: &[&str]) {
        self.push_rule(pattern, Response::SpawnError, false);
    }

    /// Matching invocations fail with a timeout.
    pub fn time_out(&self, pattern: &[&str]) {
        self.push_rule(pattern, Response::Timeout, false);
    }

    /// Hold the next matching invocation open until the returned sender
    /// sends or is dropped.
    pub fn gate(&self, pattern: &[&str]) -> Sender<()> {
        let (tx, rx) = unbounded();
        lock_recover(&self.gates).push(Gate {
            pattern: to_pattern(pattern),
            release: rx,
        });
        tx
    }

    /// Sleep this long inside every invocation.
    pub fn set_delay(&self, delay: Duration) {
        *lock_recover(&self.delay) = Some(delay);
    }

    /// Receives every invocation as it starts.
    pub fn started(&self) -> Receiver<Invocation> {
        self.started_rx.clone()
    }

    /// All invocations so far, in order.
    pub fn invocations(&self) -> Vec<Invocation> {
        lock_recover(&self.history).clone()
    }

    /// Number of recorded invocations matching `pattern`.
    pub fn count_matching(&self, pattern: &[&str]) -> usize {
        let pattern = to_pattern(pattern);
        lock_recover(&self.history)
            .iter()
            .filter(|inv| matches(&pattern, &inv.args))
            .count()
    }

    /// Highest number of invocations observed running at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn response_for(&self, args: &[String]) -> Option<Response> {
        let mut rules = lock_recover(&self.rules);
        let index = rules.iter().position(|r| matches(&r.pattern, args))?;
        if rules[index].once {
            Some(rules.remove(index).response)
        } else {
            Some(rules[index].response.clone())
        }
    }

    fn take_gate(&self, args: &[String]) -> Option<Receiver<()>> {
        let mut gates = lock_recover(&self.gates);
        let index = gates.iter().position(|g| matches(&g.pattern, args))?;
        Some(gates.remove(index).release)
    }
}

impl ProcessRunner for ScriptedRunner {
    fn run(&self, invocation: &Invocation) -> Result<ProcessOutput, ProcessError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        lock_recover(&self.history).push(invocation.clone());
        let _ = self.started_tx.send(invocation.clone());

        if let Some(release) = self.take_gate(&invocation.args) {
            let _ = release.recv();
        }
        let delay = *lock_recover(&self.delay);
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let result = match self.response_for(&invocation.args) {
            None => Ok(ProcessOutput::default()),
            Some(Response::Output(out)) => Ok(out),
            Some(Response::SpawnError) => Err(ProcessError::Spawn {
                program: invocation.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            }),
            Some(Response::Timeout) => Err(ProcessError::Timeout {
                program: invocation.program.clone(),
                timeout: invocation.timeout,
            }),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inv(args: &[&str]) -> Invocation {
        Invocation::new("git", "/repo", Duration::from_secs(1)).args(args.iter().copied())
    }

    #[test]
    fn test_unmatched_invocation_succeeds_empty() {
        let runner = ScriptedRunner::new();
        let out = runner.run(&inv(&["status"])).unwrap();
        assert!(out.success());
        assert!(out.stdout_lines.is_empty());
    }

    #[test]
    fn test_respond_once_is_consumed() {
        let runner = ScriptedRunner::new();
        runner.respond_once(&["push"], ProcessOutput::failed(1, ["fatal: rejected"]));

        assert!(!runner.run(&inv(&["push", "origin"])).unwrap().success());
        assert!(runner.run(&inv(&["push", "origin"])).unwrap().success());
        assert_eq!(runner.count_matching(&["push"]), 2);
    }

    #[test]
    fn test_pattern_must_be_contiguous() {
        let runner = ScriptedRunner::new();
        runner.respond(&["lfs", "locks"], ProcessOutput::ok(["[]"]));

        let out = runner.run(&inv(&["lfs", "lock", "locks"])).unwrap();
        assert!(out.stdout_lines.is_empty());
        let out = runner.run(&inv(&["lfs", "locks", "--json"])).unwrap();
        assert_eq!(out.stdout_lines, vec!["[]"]);
    }

    #[test]
    fn test_spawn_and_timeout_errors() {
        let runner = ScriptedRunner::new();
        runner.fail_spawn(&["version"]);
        runner.time_out(&["fetch"]);

        assert!(matches!(runner.run(&inv(&["version"])), Err(ProcessError::Spawn { .. })));
        assert!(matches!(runner.run(&inv(&["fetch"])), Err(ProcessError::Timeout { .. })));
    }
}
