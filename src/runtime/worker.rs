//! The single worker thread that owns every driver.
//!
//! All mutation of the activity tree happens inside jobs executed here, one at
//! a time, under the core lock. Jobs arrive over an unbounded channel either
//! for immediate execution or for a deadline; the loop sleeps until the next
//! deadline, the active driver's redraw timer, or the next metrics emission.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use parking_lot::Mutex;

use crate::error::{Result, RuntimeError};
use crate::logging::{LogLevel, json_str};
use crate::metrics::RuntimeMetrics;

use super::driver::panic_message;
use super::manager::Core;

const TARGET: &str = "room::activity.worker";

pub(super) type Job = Box<dyn FnOnce(&mut Core) + Send>;

pub(super) enum Command {
    Run(Job),
    RunAt(Instant, Job),
    Stop,
}

/// Whether a submission is still accepted once halting began.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Admission {
    Normal,
    /// Conclusions and bookkeeping that must drain during halt.
    Draining,
}

/// State shared between the manager, every context and the worker thread.
pub(crate) struct ManagerShared {
    sender: Sender<Command>,
    done: Receiver<()>,
    worker_thread: OnceLock<ThreadId>,
    halting: AtomicBool,
    stopped: AtomicBool,
    pub(super) redraw_debounce: Duration,
    metrics: Option<Arc<Mutex<RuntimeMetrics>>>,
}

impl ManagerShared {
    pub(super) fn is_worker_thread(&self) -> bool {
        self.worker_thread.get() == Some(&thread::current().id())
    }

    pub(super) fn worker_thread(&self) -> Option<ThreadId> {
        self.worker_thread.get().copied()
    }

    pub(super) fn is_halting(&self) -> bool {
        self.halting.load(AtomicOrdering::SeqCst)
    }

    /// Flip into halting. Returns `true` for the first caller only.
    pub(super) fn begin_halt(&self) -> bool {
        !self.halting.swap(true, AtomicOrdering::SeqCst)
    }

    pub(super) fn is_stopped(&self) -> bool {
        self.stopped.load(AtomicOrdering::SeqCst)
    }

    fn admit(&self, admission: Admission) -> Result<()> {
        if self.is_stopped() {
            return Err(RuntimeError::WorkerStopped);
        }
        if admission == Admission::Normal && self.is_halting() {
            return Err(RuntimeError::Halting);
        }
        Ok(())
    }

    pub(super) fn submit(&self, admission: Admission, job: Job) -> Result<()> {
        self.admit(admission)?;
        self.sender
            .send(Command::Run(job))
            .map_err(|_| RuntimeError::WorkerStopped)
    }

    pub(super) fn submit_at(&self, admission: Admission, at: Instant, job: Job) -> Result<()> {
        self.admit(admission)?;
        self.sender
            .send(Command::RunAt(at, job))
            .map_err(|_| RuntimeError::WorkerStopped)
    }

    /// Run `work` on the worker and block for its result.
    pub(super) fn submit_sync<R, F>(&self, admission: Admission, work: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Core) -> Result<R> + Send + 'static,
    {
        if self.is_worker_thread() {
            return Err(RuntimeError::ReentrantCall);
        }
        let (reply, receive) = bounded(1);
        self.submit(
            admission,
            Box::new(move |core: &mut Core| {
                let _ = reply.send(work(core));
            }),
        )?;
        receive.recv().map_err(|_| RuntimeError::WorkerStopped)?
    }

    pub(super) fn stop(&self) {
        let _ = self.sender.send(Command::Stop);
    }

    /// Wait for the worker loop to exit.
    pub(super) fn wait_stopped(&self, timeout: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        !matches!(self.done.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }

    pub(super) fn record_metric(&self, update: impl FnOnce(&mut RuntimeMetrics)) {
        if let Some(metrics) = &self.metrics {
            update(&mut metrics.lock());
        }
    }
}

/// Channel ends handed to the worker when it is spawned.
pub(super) struct WorkerPorts {
    commands: Receiver<Command>,
    done: Sender<()>,
}

pub(super) fn channel(
    redraw_debounce: Duration,
    metrics: Option<Arc<Mutex<RuntimeMetrics>>>,
) -> (Arc<ManagerShared>, WorkerPorts) {
    let (sender, commands) = unbounded();
    let (done_tx, done_rx) = bounded(0);
    let shared = Arc::new(ManagerShared {
        sender,
        done: done_rx,
        worker_thread: OnceLock::new(),
        halting: AtomicBool::new(false),
        stopped: AtomicBool::new(false),
        redraw_debounce,
        metrics,
    });
    (
        shared,
        WorkerPorts {
            commands,
            done: done_tx,
        },
    )
}

pub(super) fn spawn(
    name: &str,
    core: Arc<Mutex<Core>>,
    shared: Arc<ManagerShared>,
    ports: WorkerPorts,
) -> Result<JoinHandle<()>> {
    let loop_shared = Arc::clone(&shared);
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || run(core, loop_shared, ports))?;
    // Set before any job can observe it: jobs only arrive after `new` returns.
    let _ = shared.worker_thread.set(handle.thread().id());
    Ok(handle)
}

struct Scheduled {
    at: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so the max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

fn run(core: Arc<Mutex<Core>>, shared: Arc<ManagerShared>, ports: WorkerPorts) {
    let WorkerPorts { commands, done } = ports;
    let mut delayed: BinaryHeap<Scheduled> = BinaryHeap::new();
    let mut seq = 0u64;

    loop {
        let wake = {
            let core = core.lock();
            earliest(delayed.peek().map(|next| next.at), core.next_wakeup())
        };
        let received = match wake {
            Some(deadline) => commands.recv_deadline(deadline),
            None => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(Command::Run(job)) => execute(&core, job),
            Ok(Command::RunAt(at, job)) => {
                seq += 1;
                delayed.push(Scheduled { at, seq, job });
            }
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        while delayed.peek().is_some_and(|next| next.at <= now) {
            if let Some(scheduled) = delayed.pop() {
                execute(&core, scheduled.job);
            }
        }

        let mut core = core.lock();
        core.fire_due_timer(now);
        core.maybe_emit_metrics(now);
    }

    shared.stopped.store(true, AtomicOrdering::SeqCst);
    core.lock().log(LogLevel::Debug, TARGET, "worker_stopped", []);
    drop(done);
}

fn execute(core: &Arc<Mutex<Core>>, job: Job) {
    let mut guard = core.lock();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| job(&mut guard)));
    if let Err(payload) = outcome {
        guard.log(
            LogLevel::Error,
            TARGET,
            "worker_job_panicked",
            [json_str("error", panic_message(payload.as_ref()))],
        );
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
