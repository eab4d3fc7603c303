//! Per-driver handle given to activity code.
//!
//! Every callback receives an [`ActivityContext`]. It can be cloned freely and
//! moved to other threads; from there it is the only way back onto the worker.
//! Launch and conclusion requests are staged on the context and resolved by the
//! manager once the current unit of work finishes.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use parking_lot::Mutex;

use crate::activity::{Activity, DriverId, LifecycleState};
use crate::error::{ActivityError, ActivityResult, Result, RuntimeError};
use crate::launch::{Conclusion, DeferredActivity};

use super::driver::{Driver, panic_message};
use super::manager::Core;
use super::worker::{Admission, Job, ManagerShared};

#[derive(Default)]
struct Staged {
    launch: Option<DeferredActivity>,
    conclusion: Option<Conclusion>,
    redraw_requested: bool,
    debounce_pending: bool,
}

struct ContextInner {
    driver: DriverId,
    chain: Vec<DriverId>,
    application: String,
    activity: String,
    staged: Mutex<Staged>,
    shared: Arc<ManagerShared>,
}

#[derive(Clone)]
pub struct ActivityContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for ActivityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityContext")
            .field("driver", &self.inner.driver)
            .field("application", &self.inner.application)
            .field("activity", &self.inner.activity)
            .finish()
    }
}

impl ActivityContext {
    pub(super) fn new(
        driver: DriverId,
        chain: Vec<DriverId>,
        application: String,
        activity: String,
        shared: Arc<ManagerShared>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                driver,
                chain,
                application,
                activity,
                staged: Mutex::new(Staged::default()),
                shared,
            }),
        }
    }

    pub fn driver(&self) -> DriverId {
        self.inner.driver
    }

    /// Root-first ancestor chain of the owning driver, including itself.
    pub fn chain(&self) -> &[DriverId] {
        &self.inner.chain
    }

    pub fn application(&self) -> &str {
        &self.inner.application
    }

    pub fn activity(&self) -> &str {
        &self.inner.activity
    }

    pub fn is_worker_thread(&self) -> bool {
        self.inner.shared.is_worker_thread()
    }

    pub fn is_halting(&self) -> bool {
        self.inner.shared.is_halting()
    }

    /// Queue `work` on the worker. Safe from any thread, including the worker.
    ///
    /// When the work finishes the manager runs its redraw and
    /// launch/conclusion checks for this driver before the completion fires.
    pub fn perform<R, F>(&self, work: F) -> Completion<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut WorkScope<'_>) -> ActivityResult<R> + Send + 'static,
    {
        let (reply, completion) = Completion::channel(self.inner.shared.worker_thread());
        self.perform_into(reply, work);
        completion
    }

    fn perform_into<R, F>(&self, reply: Sender<Result<R>>, work: F)
    where
        R: Send + 'static,
        F: FnOnce(&mut WorkScope<'_>) -> ActivityResult<R> + Send + 'static,
    {
        let id = self.inner.driver;
        let fallback = reply.clone();
        let job: Job = Box::new(move |core: &mut Core| {
            let result = core.run_unit(id, work);
            core.after_work(id);
            let _ = reply.send(result);
        });
        if let Err(err) = self.inner.shared.submit(Admission::Normal, job) {
            let _ = fallback.send(Err(err));
        }
    }

    /// Run `work` on the worker and wait for it. Fails with
    /// [`RuntimeError::ReentrantCall`] when issued from the worker itself.
    pub fn call<R, F>(&self, work: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut WorkScope<'_>) -> ActivityResult<R> + Send + 'static,
    {
        if self.is_worker_thread() {
            return Err(RuntimeError::ReentrantCall);
        }
        self.perform(work).wait()
    }

    /// Load off the worker, then apply the result on it.
    ///
    /// From the worker, `loader` runs on a fresh background thread; from any
    /// other thread it runs inline before `apply` is queued.
    pub fn spawn_load<T, L, A>(&self, loader: L, apply: A) -> Completion<()>
    where
        T: Send + 'static,
        L: FnOnce() -> ActivityResult<T> + Send + 'static,
        A: FnOnce(&mut WorkScope<'_>, ActivityResult<T>) -> ActivityResult<()> + Send + 'static,
    {
        let (reply, completion) = Completion::channel(self.inner.shared.worker_thread());

        if !self.is_worker_thread() {
            let loaded = guarded_load(loader);
            self.perform_into(reply, move |scope| apply(scope, loaded));
            return completion;
        }

        let ctx = self.clone();
        let fallback = reply.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-load-{}", self.inner.activity, self.inner.driver.get()))
            .spawn(move || {
                let loaded = guarded_load(loader);
                ctx.perform_into(reply, move |scope| apply(scope, loaded));
            });
        if let Err(err) = spawned {
            let _ = fallback.send(Err(RuntimeError::Io(err)));
        }
        completion
    }

    /// Ask for a redraw of this driver.
    ///
    /// On the worker this only flags the request; the manager renders once the
    /// current unit of work ends. Elsewhere requests are debounced so a burst
    /// collapses into a single render.
    pub fn request_redraw(&self) {
        if self.is_worker_thread() {
            self.inner.staged.lock().redraw_requested = true;
            return;
        }
        {
            let mut staged = self.inner.staged.lock();
            if staged.debounce_pending {
                return;
            }
            staged.debounce_pending = true;
        }

        let id = self.inner.driver;
        let shared = &self.inner.shared;
        let at = Instant::now() + shared.redraw_debounce;
        let job: Job = Box::new(move |core: &mut Core| core.debounced_redraw(id));
        match shared.submit_at(Admission::Normal, at, job) {
            Ok(()) => shared.record_metric(|metrics| metrics.record_debounced_redraw()),
            Err(_) => self.clear_debounce(),
        }
    }

    /// Arm a one-shot redraw, keeping any earlier deadline.
    pub fn schedule_redraw_after(&self, delay: Duration) {
        let id = self.inner.driver;
        let at = Instant::now() + delay;
        let job: Job = Box::new(move |core: &mut Core| core.arm_timer(id, at, Duration::ZERO));
        let _ = self.inner.shared.submit(Admission::Normal, job);
    }

    /// Redraw every `period` while this driver stays active.
    pub fn schedule_redraw_every(&self, period: Duration) {
        let id = self.inner.driver;
        let first = Instant::now() + period;
        let job: Job = Box::new(move |core: &mut Core| core.arm_timer(id, first, period));
        let _ = self.inner.shared.submit(Admission::Normal, job);
    }

    pub fn cancel_scheduled_redraw(&self) {
        let id = self.inner.driver;
        let job: Job = Box::new(move |core: &mut Core| core.cancel_timer(id));
        let _ = self.inner.shared.submit(Admission::Draining, job);
    }

    /// Stage a launch. Only one launch may be pending per driver.
    ///
    /// While the runtime is halting the request is dropped silently.
    pub fn request_launch(&self, launch: DeferredActivity) -> Result<()> {
        if self.is_halting() {
            return Ok(());
        }
        let mut launch = launch;
        launch.set_ancestors(self.inner.chain.clone());
        {
            let mut staged = self.inner.staged.lock();
            if staged.launch.is_some() {
                return Err(RuntimeError::LaunchAlreadyPending(self.inner.driver));
            }
            staged.launch = Some(launch);
        }
        self.schedule_check();
        Ok(())
    }

    /// Stage a conclusion. A later request replaces an earlier one.
    pub fn request_conclusion(&self, conclusion: Conclusion) {
        self.inner.staged.lock().conclusion = Some(conclusion);
        self.schedule_check();
    }

    pub fn has_pending_launch(&self) -> bool {
        self.inner.staged.lock().launch.is_some()
    }

    pub fn has_pending_conclusion(&self) -> bool {
        self.inner.staged.lock().conclusion.is_some()
    }

    /// Off the worker nothing else would pick the request up.
    fn schedule_check(&self) {
        if self.is_worker_thread() {
            return;
        }
        let id = self.inner.driver;
        let job: Job = Box::new(move |core: &mut Core| core.after_work(id));
        let _ = self.inner.shared.submit(Admission::Draining, job);
    }

    pub(super) fn take_launch(&self) -> Option<DeferredActivity> {
        self.inner.staged.lock().launch.take()
    }

    pub(super) fn take_conclusion(&self) -> Option<Conclusion> {
        self.inner.staged.lock().conclusion.take()
    }

    pub(super) fn take_redraw_request(&self) -> bool {
        std::mem::take(&mut self.inner.staged.lock().redraw_requested)
    }

    pub(super) fn clear_debounce(&self) {
        self.inner.staged.lock().debounce_pending = false;
    }
}

fn guarded_load<T>(loader: impl FnOnce() -> ActivityResult<T>) -> ActivityResult<T> {
    panic::catch_unwind(AssertUnwindSafe(loader)).unwrap_or_else(|payload| {
        Err(ActivityError::msg(format!(
            "loader panicked: {}",
            panic_message(payload.as_ref())
        )))
    })
}

/// Access to the owning driver while a unit of work runs on the worker.
pub struct WorkScope<'a> {
    driver: &'a mut Driver,
    ctx: &'a ActivityContext,
}

impl<'a> WorkScope<'a> {
    pub(super) fn new(driver: &'a mut Driver, ctx: &'a ActivityContext) -> Self {
        Self { driver, ctx }
    }

    /// Downcast the driven activity to its concrete type.
    pub fn activity<T: Activity>(&mut self) -> Option<&mut T> {
        let activity: &mut dyn std::any::Any = &mut *self.driver.activity;
        activity.downcast_mut::<T>()
    }

    pub fn context(&self) -> &ActivityContext {
        self.ctx
    }

    pub fn state(&self) -> LifecycleState {
        self.driver.state
    }

    pub fn driver(&self) -> DriverId {
        self.driver.id
    }
}

/// Result of work queued on the worker.
#[must_use = "a completion does nothing unless waited on or polled"]
pub struct Completion<R> {
    receiver: Receiver<Result<R>>,
    worker: Option<ThreadId>,
}

impl<R> Completion<R> {
    fn channel(worker: Option<ThreadId>) -> (Sender<Result<R>>, Self) {
        let (sender, receiver) = bounded(1);
        (sender, Self { receiver, worker })
    }

    fn on_worker(&self) -> bool {
        self.worker == Some(thread::current().id())
    }

    /// Block until the work ran. Waiting on the worker itself would deadlock
    /// and fails with [`RuntimeError::ReentrantCall`] instead.
    pub fn wait(self) -> Result<R> {
        if self.on_worker() {
            return Err(RuntimeError::ReentrantCall);
        }
        self.receiver
            .recv()
            .map_err(|_| RuntimeError::WorkerStopped)?
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<R>> {
        if self.on_worker() {
            return Some(Err(RuntimeError::ReentrantCall));
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(RuntimeError::WorkerStopped)),
        }
    }

    pub fn try_take(&self) -> Option<Result<R>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(RuntimeError::WorkerStopped)),
        }
    }
}
