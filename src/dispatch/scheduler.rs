//! Scheduler thread for periodic background fetches.
//!
//! Every interval the scheduler queues a `Fetch`, which the worker follows
//! with a status refresh of the cached paths. A tick is skipped while the
//! previous fetch is still queued or running.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::operation::{Operation, OperationKind};
use super::worker::Submitter;

/// How often the shutdown flag is checked while waiting for the next tick.
const SLEEP_STEP: Duration = Duration::from_millis(50);

/// Background scheduler that periodically fetches from the remote.
pub struct Scheduler {
    submitter: Submitter,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    in_flight: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(submitter: Submitter, interval: Duration, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            submitter,
            interval,
            shutdown,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run the scheduler loop.
    pub fn run(self) {
        log::info!("Scheduler thread started, fetching every {:?}", self.interval);

        loop {
            let wake = Instant::now() + self.interval;
            // Sleep in small increments to check shutdown more often
            while Instant::now() < wake {
                if self.shutdown.load(Ordering::SeqCst) {
                    log::info!("Scheduler shutting down");
                    return;
                }
                thread::sleep(SLEEP_STEP.min(wake.saturating_duration_since(Instant::now())));
            }

            if self.shutdown.load(Ordering::SeqCst) {
                log::info!("Scheduler shutting down");
                return;
            }

            if !self.tick() {
                log::warn!("Worker unavailable, stopping scheduler");
                return;
            }
        }
    }

    /// Queue one background fetch unless the previous one is still in flight.
    /// Returns false once the worker is gone.
    fn tick(&self) -> bool {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            log::debug!("Previous background fetch still running, skipping");
            return true;
        }

        let in_flight = self.in_flight.clone();
        let result = self.submitter.submit_async(
            Operation::repository(OperationKind::Fetch),
            Some(Box::new(move |op| {
                log::debug!("Background fetch #{} finished: {:?}", op.id, op.result);
                in_flight.store(false, Ordering::SeqCst);
            })),
        );
        match result {
            Ok(id) => {
                log::debug!("Scheduled background fetch #{}", id);
                true
            }
            Err(_) => {
                self.in_flight.store(false, Ordering::SeqCst);
                false
            }
        }
    }
}

/// Handle for managing the scheduler thread.
pub struct SchedulerHandle {
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl SchedulerHandle {
    /// Spawn the scheduler thread.
    pub fn spawn(submitter: Submitter, interval: Duration) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let scheduler = Scheduler::new(submitter, interval, shutdown.clone());

        let thread = thread::Builder::new()
            .name("gitsc-scheduler".to_string())
            .spawn(move || scheduler.run())?;

        Ok(Self {
            thread: Some(thread),
            shutdown,
        })
    }

    /// Signal shutdown and wait for thread to exit.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
