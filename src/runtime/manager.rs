//! Activity manager: the public entry point and the worker-owned core.
//!
//! [`ActivityManager`] is a thin handle. Every operation is marshalled onto the
//! worker as a job against [`Core`], which owns the tree, the drivers and the
//! active pointer. Launch and conclusion requests staged on contexts are
//! resolved here after each unit of work.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};

use crate::activity::{
    Activity, ActivityRegistry, ActivityResponse, DriverId, LifecycleState, Relaunch,
};
use crate::display::{NullSurface, Surface};
use crate::error::{ActivityError, ActivityResult, Result, RuntimeError};
use crate::launch::{Conclusion, DeferredActivity, LaunchMode, Placement};
use crate::logging::{LogLevel, Logger, event_with_fields, json_kv, json_str};
use crate::metrics::{MetricSnapshot, RuntimeMetrics};

use super::audit::{LifecycleAuditEventBuilder, LifecycleAuditStage};
use super::context::{ActivityContext, WorkScope};
use super::driver::{Driver, invoke, panic_message};
use super::tree::ActivityTree;
use super::worker::{self, Admission, Job, ManagerShared};
use super::{ActivityEvent, ManagerConfig};

const TARGET: &str = "room::activity.manager";

/// Everything the worker mutates. Only ever touched under the core lock.
pub(crate) struct Core {
    pub(super) tree: ActivityTree,
    pub(super) drivers: HashMap<DriverId, Driver>,
    pub(super) active: Option<DriverId>,
    registry: ActivityRegistry,
    pub(super) surface: Box<dyn Surface>,
    pub(super) shared: Arc<ManagerShared>,
    config: ManagerConfig,
    started_at: Instant,
    last_metrics_emit: Instant,
}

/// Launch target resolved and instantiated, not yet part of the forest.
struct PreparedLaunch {
    launch: DeferredActivity,
    application: String,
    activity_id: String,
    title: String,
    activity: Box<dyn Activity>,
}

impl Core {
    fn new(
        registry: ActivityRegistry,
        surface: Box<dyn Surface>,
        config: ManagerConfig,
        shared: Arc<ManagerShared>,
    ) -> Self {
        let now = Instant::now();
        Self {
            tree: ActivityTree::new(),
            drivers: HashMap::new(),
            active: None,
            registry,
            surface,
            shared,
            config,
            started_at: now,
            last_metrics_emit: now,
        }
    }

    pub(super) fn log<I>(&self, level: LogLevel, target: &str, message: &str, fields: I)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        if let Some(logger) = self.config.logger.as_ref() {
            if logger.enabled(level) {
                let _ = logger.log_event(event_with_fields(level, target, message, fields));
            }
        }
    }

    pub(super) fn audit(
        &self,
        stage: LifecycleAuditStage,
        driver: Option<DriverId>,
        fill: impl FnOnce(&mut LifecycleAuditEventBuilder),
    ) {
        let mut builder = LifecycleAuditEventBuilder::new(stage);
        if let Some(driver) = driver {
            builder.driver(driver);
        }
        fill(&mut builder);
        self.config.audit.record(builder.finish());
    }

    pub(super) fn record(&self, update: impl FnOnce(&mut RuntimeMetrics)) {
        self.shared.record_metric(update);
    }

    fn metrics_enabled(&self) -> bool {
        self.config.metrics.is_some()
            && self.config.logger.is_some()
            && !self.config.metrics_interval.is_zero()
    }

    /// Earliest instant the worker must wake for timers or metrics.
    pub(super) fn next_wakeup(&self) -> Option<Instant> {
        let timer = self
            .active
            .and_then(|id| self.drivers.get(&id))
            .and_then(|driver| driver.timer.target());
        let metrics = self
            .metrics_enabled()
            .then(|| self.last_metrics_emit + self.config.metrics_interval);
        match (timer, metrics) {
            (Some(timer), Some(metrics)) => Some(timer.min(metrics)),
            (timer, metrics) => timer.or(metrics),
        }
    }

    pub(super) fn maybe_emit_metrics(&mut self, now: Instant) {
        if !self.metrics_enabled()
            || now.duration_since(self.last_metrics_emit) < self.config.metrics_interval
        {
            return;
        }
        self.last_metrics_emit = now;

        if let (Some(logger), Some(metrics)) =
            (self.config.logger.as_ref(), self.config.metrics.as_ref())
        {
            let uptime = now.duration_since(self.started_at);
            let event = metrics
                .lock()
                .snapshot(uptime)
                .to_log_event(&self.config.metrics_target);
            let _ = logger.log_event(event);
        }
    }

    /// Execute a unit of work against driver `id`.
    pub(super) fn run_unit<R, F>(&mut self, id: DriverId, work: F) -> Result<R>
    where
        F: FnOnce(&mut WorkScope<'_>) -> ActivityResult<R>,
    {
        let driver = self
            .drivers
            .get_mut(&id)
            .ok_or(RuntimeError::UnknownDriver(id))?;
        let ctx = driver.context.clone();
        let state = driver.state;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut scope = WorkScope::new(driver, &ctx);
            work(&mut scope)
        }));

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                self.fault(id, state, "perform", err.to_string());
                Err(RuntimeError::Activity(err))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                self.fault(id, state, "perform", message.clone());
                Err(RuntimeError::WorkPanicked(message))
            }
        }
    }

    /// Post-work checks: pending redraw, then staged launch/conclusion.
    pub(super) fn after_work(&mut self, id: DriverId) {
        let Some(driver) = self.drivers.get(&id) else {
            return;
        };
        if driver.context.take_redraw_request() {
            self.redraw(id);
        }
        match self.check_conclusion_and_or_launch(id) {
            Ok(()) | Err(RuntimeError::RootConclusion) => {}
            Err(err) => self.log(
                LogLevel::Error,
                TARGET,
                "request_resolution_failed",
                [json_kv("driver", id.get()), json_str("error", err.to_string())],
            ),
        }
    }

    pub(super) fn schedule_check(&self, id: DriverId) {
        let job: Job = Box::new(move |core: &mut Core| core.after_work(id));
        let _ = self.shared.submit(Admission::Draining, job);
    }

    /// Requests staged during a resolution belong to the next unit of work.
    fn schedule_active_check(&self) {
        if let Some(id) = self.active {
            self.schedule_check(id);
        }
    }

    pub(super) fn check_conclusion_and_or_launch(&mut self, id: DriverId) -> Result<()> {
        let Some(driver) = self.drivers.get(&id) else {
            return Ok(());
        };
        let state = driver.state;
        let ctx = driver.context.clone();
        let conclusion = if state > LifecycleState::Constructed {
            ctx.take_conclusion()
        } else {
            None
        };
        let launch = if state >= LifecycleState::Open {
            ctx.take_launch()
        } else {
            None
        };

        match (launch, conclusion) {
            (Some(launch), conclusion) => self.resolve_launch(Some(id), launch, conclusion).map(|_| ()),
            (None, Some(conclusion)) => self.resolve_conclusion(id, conclusion),
            (None, None) => Ok(()),
        }
    }

    /// Make `id` the active driver, passivating the previous one first.
    pub(super) fn activate(&mut self, id: DriverId) -> Result<()> {
        if let Some(current) = self.active.filter(|current| *current != id) {
            if self.drivers.contains_key(&current) {
                self.transition_down_to(current, LifecycleState::Open)?;
            }
        }
        self.active = Some(id);
        self.transition_up_to(id, LifecycleState::Active)
    }

    /// Resolve the target and run its factory. Nothing has been torn down yet,
    /// so a failure here leaves the forest untouched.
    fn prepare_launch(
        &self,
        launch: DeferredActivity,
        inherited_application: Option<&str>,
    ) -> Result<PreparedLaunch> {
        if self.shared.is_halting() {
            return Err(RuntimeError::Halting);
        }
        let spec = launch.spec();
        let activity_id = spec.activity.clone();
        let application = spec
            .application
            .clone()
            .or_else(|| inherited_application.map(str::to_string))
            .ok_or_else(|| RuntimeError::MissingApplication(activity_id.clone()))?;
        let definition = self.registry.resolve(&application, &activity_id)?;
        let factory = Arc::clone(&definition.factory);
        let title = definition.title.clone();

        let activity = invoke(|| Ok(factory(launch.spec()))).map_err(|message| {
            RuntimeError::Activity(ActivityError::msg(format!(
                "factory for `{activity_id}` failed: {message}"
            )))
        })?;
        Ok(PreparedLaunch {
            launch,
            application,
            activity_id,
            title,
            activity,
        })
    }

    /// Build a driver under `parent` and drive it to ACTIVE.
    fn launch_activity_impl(
        &mut self,
        parent: Option<DriverId>,
        prepared: PreparedLaunch,
    ) -> Result<DriverId> {
        let PreparedLaunch {
            launch,
            application,
            activity_id,
            title,
            activity,
        } = prepared;
        if let Some(parent) = parent {
            if !self.tree.contains(parent) {
                return Err(RuntimeError::UnknownDriver(parent));
            }
        }

        if let Some(current) = self.active {
            if self.drivers.contains_key(&current) {
                self.transition_down_to(current, LifecycleState::Open)?;
            }
        }

        let id = self.tree.allocate_id();
        let mut chain = parent.map(|p| self.tree.chain(p)).unwrap_or_default();
        chain.push(id);
        let context = ActivityContext::new(
            id,
            chain,
            application.clone(),
            activity_id.clone(),
            Arc::clone(&self.shared),
        );
        let driver = Driver::new(
            id,
            parent,
            application.clone(),
            title,
            launch,
            activity,
            context,
            self.config.input,
        );
        self.drivers.insert(id, driver);

        self.record(|metrics| metrics.record_launch());
        self.audit(LifecycleAuditStage::DriverCreated, Some(id), |event| {
            event
                .detail("application", json!(application))
                .detail("activity", json!(activity_id))
                .detail("parent", json!(parent.map(DriverId::get)));
        });
        self.log(
            LogLevel::Info,
            TARGET,
            "activity_launched",
            [
                json_kv("driver", id.get()),
                json_str("application", application.as_str()),
                json_str("activity", activity_id.as_str()),
                json_kv("parent", json!(parent.map(DriverId::get))),
            ],
        );

        self.active = Some(id);
        self.transition_up_to(id, LifecycleState::Active)?;
        Ok(id)
    }

    /// Tear down one driver that has nothing above it. Returns its parent.
    fn conclude_single(&mut self, id: DriverId, value: Option<Conclusion>) -> Result<Option<DriverId>> {
        let parent = if self.tree.contains(id) {
            self.tree.previous(id)
        } else {
            self.drivers.get(&id).and_then(|driver| driver.parent)
        };
        self.transition_down_to(id, LifecycleState::Constructed)?;
        if self.active == Some(id) {
            self.active = None;
        }
        let driver = self
            .drivers
            .remove(&id)
            .ok_or(RuntimeError::UnknownDriver(id))?;

        let spec = driver.launch.spec();
        let mut responded = false;
        if spec.mode.respond {
            if let (Some(Conclusion::Data(data)), Some(receiver)) =
                (value, parent.and_then(|p| self.drivers.get_mut(&p)))
            {
                receiver.pending_responses.push_back(ActivityResponse {
                    from: id,
                    activity: driver.activity_id.clone(),
                    request_id: spec.request_id.clone(),
                    data,
                });
                responded = true;
            }
        }

        self.record(|metrics| metrics.record_conclusion());
        self.audit(LifecycleAuditStage::ConclusionResolved, Some(id), |event| {
            event.detail("responded", json!(responded));
        });
        self.log(
            LogLevel::Info,
            TARGET,
            "activity_concluded",
            [
                json_kv("driver", id.get()),
                json_str("activity", driver.activity_id.as_str()),
                json_kv("responded", responded),
            ],
        );
        Ok(parent)
    }

    /// Conclude every driver above `ancestor`, topmost first. Nothing is
    /// reactivated along the way.
    pub(super) fn conclude_up_to(&mut self, ancestor: DriverId) -> Result<()> {
        loop {
            let top = self.tree.top_of(ancestor);
            if top == ancestor {
                return Ok(());
            }
            self.conclude_single(top, None)?;
        }
    }

    /// Conclude `id` and everything above it, optionally reactivating the top
    /// of its parent's chain when the active driver went away.
    pub(super) fn conclude_activity_impl(
        &mut self,
        id: DriverId,
        value: Option<Conclusion>,
        reactivate: bool,
    ) -> Result<()> {
        if !self.drivers.contains_key(&id) {
            return Err(RuntimeError::UnknownDriver(id));
        }
        self.conclude_up_to(id)?;
        let parent = self.conclude_single(id, value)?;

        if reactivate && self.active.is_none() {
            let next = parent
                .filter(|parent| self.tree.contains(*parent))
                .map(|parent| self.tree.top_of(parent))
                .or_else(|| self.tree.top());
            if let Some(next) = next {
                self.activate(next)?;
            }
        }
        Ok(())
    }

    fn resolve_conclusion(&mut self, id: DriverId, conclusion: Conclusion) -> Result<()> {
        if self.tree.contains(id) && self.tree.previous(id).is_none() && self.tree.roots().len() <= 1 {
            self.audit(LifecycleAuditStage::ConclusionRefused, Some(id), |_| {});
            self.log(
                LogLevel::Warn,
                TARGET,
                "root_conclusion_refused",
                [json_kv("driver", id.get())],
            );
            return Err(RuntimeError::RootConclusion);
        }
        self.conclude_activity_impl(id, Some(conclusion), true)?;
        self.schedule_active_check();
        Ok(())
    }

    fn refuse_launch(&self, origin: Option<DriverId>, activity: &str, reason: &str) {
        self.audit(LifecycleAuditStage::LaunchRefused, origin, |event| {
            event
                .detail("activity", json!(activity))
                .detail("reason", json!(reason));
        });
        let level = if reason == "halting" {
            LogLevel::Debug
        } else {
            LogLevel::Error
        };
        self.log(
            level,
            TARGET,
            "launch_refused",
            [json_str("activity", activity), json_str("reason", reason)],
        );
    }

    /// Resolve a launch, possibly together with the requester's conclusion.
    /// Returns the driver that ended up active, or `None` when dropped.
    fn resolve_launch(
        &mut self,
        origin: Option<DriverId>,
        launch: DeferredActivity,
        conclusion: Option<Conclusion>,
    ) -> Result<Option<DriverId>> {
        let spec = launch.spec();
        let activity_id = spec.activity.clone();
        let mode = spec.mode;

        if self.shared.is_halting() {
            self.refuse_launch(origin, &activity_id, "halting");
            if let (Some(origin), Some(conclusion)) = (origin, conclusion) {
                self.resolve_conclusion(origin, conclusion)?;
            }
            return Ok(None);
        }

        let mut requester = self.tree.resolve_chain(&spec.ancestors);
        if requester.is_none() && mode.placement != Placement::Detached {
            let ancestors = spec.ancestors.clone();
            self.refuse_launch(origin, &activity_id, "unresolvable_requester");
            return Err(RuntimeError::UnresolvableRequester(ancestors));
        }
        let inherited = requester
            .and_then(|r| self.drivers.get(&r))
            .map(|driver| driver.application.clone());

        let mut launch = launch;
        if mode.relaunch {
            let target = requester
                .and_then(|r| self.relaunch_target(r, &launch, inherited.as_deref()));
            if let Some(target) = target {
                if self.offer_relaunch(target, &launch)? {
                    if conclusion.is_some() {
                        self.log(
                            LogLevel::Debug,
                            TARGET,
                            "conclusion_discarded_by_relaunch",
                            [json_kv("driver", target.get())],
                        );
                    }
                    self.schedule_active_check();
                    return Ok(Some(target));
                }
                // The requester may have sat above the target.
                if !requester.is_some_and(|r| self.tree.contains(r)) {
                    requester = Some(target);
                }
            }
            launch.clear_relaunch();
        }

        let id = self.place_launch(requester, launch, conclusion, inherited.as_deref())?;
        self.schedule_active_check();
        Ok(Some(id))
    }

    fn relaunch_target(
        &self,
        requester: DriverId,
        launch: &DeferredActivity,
        inherited: Option<&str>,
    ) -> Option<DriverId> {
        let spec = launch.spec();
        if let Some(instance) = spec.instance {
            return self
                .tree
                .is_ancestor_or_self(instance, requester)
                .then_some(instance);
        }
        let application = spec.application.as_deref().or(inherited)?;
        self.tree.chain(requester).into_iter().rev().find(|id| {
            self.drivers.get(id).is_some_and(|driver| {
                driver.application == application && driver.activity_id == spec.activity
            })
        })
    }

    /// Offer `launch` to the running `target`. `true` when it was accepted.
    fn offer_relaunch(&mut self, target: DriverId, launch: &DeferredActivity) -> Result<bool> {
        self.conclude_up_to(target)?;
        self.activate(target)?;

        let driver = self
            .drivers
            .get_mut(&target)
            .ok_or(RuntimeError::UnknownDriver(target))?;
        let ctx = driver.context.clone();
        let answered = invoke(|| driver.activity.relaunch(&ctx, launch.spec()));
        let answer = match answered {
            Ok(answer) => answer,
            Err(message) => {
                self.fault(target, LifecycleState::Active, "relaunch", message);
                Relaunch::Refused
            }
        };

        match answer {
            Relaunch::Refused => {
                self.audit(LifecycleAuditStage::RelaunchRefused, Some(target), |_| {});
                self.log(
                    LogLevel::Info,
                    TARGET,
                    "relaunch_refused",
                    [json_kv("driver", target.get())],
                );
                Ok(false)
            }
            Relaunch::Relaunched(state) => {
                self.transition_down_to(target, LifecycleState::Initialized)?;
                let driver = self
                    .drivers
                    .get_mut(&target)
                    .ok_or(RuntimeError::UnknownDriver(target))?;
                driver.launch = launch.clone();
                driver.saved_state = Some(state);
                self.activate(target)?;

                self.record(|metrics| metrics.record_relaunch());
                self.audit(LifecycleAuditStage::RelaunchAccepted, Some(target), |_| {});
                self.log(
                    LogLevel::Info,
                    TARGET,
                    "relaunch_accepted",
                    [json_kv("driver", target.get())],
                );
                Ok(true)
            }
        }
    }

    fn anchor_for(&self, placement: Placement, requester: Option<DriverId>) -> Option<DriverId> {
        match placement {
            Placement::AboveTop => self.tree.top(),
            Placement::AboveCurrent => requester,
            Placement::Detached => None,
        }
    }

    /// Resolve a requester's own conclusion outside of any replacement.
    fn settle_conclusion(&mut self, requester: DriverId, conclusion: Conclusion) {
        if !self.drivers.contains_key(&requester) {
            return;
        }
        if let Err(err) = self.resolve_conclusion(requester, conclusion) {
            self.log(
                LogLevel::Warn,
                TARGET,
                "conclusion_refused",
                [json_kv("driver", requester.get()), json_str("error", err.to_string())],
            );
        }
    }

    /// Make sure some driver is active again after a launch failed midway.
    fn restore_active(&mut self, parent: Option<DriverId>) {
        let current = self.active.and_then(|id| self.state_of(id));
        if current == Some(LifecycleState::Active) {
            return;
        }
        self.active = None;
        let next = parent
            .filter(|parent| self.tree.contains(*parent))
            .map(|parent| self.tree.top_of(parent))
            .or_else(|| self.tree.top());
        if let Some(next) = next {
            if let Err(err) = self.activate(next) {
                self.log(
                    LogLevel::Error,
                    TARGET,
                    "reactivation_failed",
                    [json_kv("driver", next.get()), json_str("error", err.to_string())],
                );
            }
        }
    }

    /// Pick the parent by placement, replacing it when asked, then launch.
    fn place_launch(
        &mut self,
        requester: Option<DriverId>,
        launch: DeferredActivity,
        conclusion: Option<Conclusion>,
        inherited: Option<&str>,
    ) -> Result<DriverId> {
        let mode = launch.spec().mode;
        let prepared = match self.prepare_launch(launch, inherited) {
            Ok(prepared) => prepared,
            Err(err) => {
                if let (Some(requester), Some(pending)) = (requester, conclusion) {
                    self.settle_conclusion(requester, pending);
                }
                return Err(err);
            }
        };

        // A staged conclusion replaces the anchor only when the anchor is the
        // requester; otherwise the requester concludes on its own first.
        let mut conclusion = conclusion;
        if let Some(requester) = requester {
            let anchored_elsewhere =
                self.anchor_for(mode.placement, Some(requester)) != Some(requester);
            if anchored_elsewhere && conclusion.is_some() {
                if let Some(pending) = conclusion.take() {
                    self.settle_conclusion(requester, pending);
                }
            }
        }
        let requester = requester.filter(|requester| self.tree.contains(*requester));
        let anchor = self.anchor_for(mode.placement, requester);
        let replace = mode.replace || conclusion.is_some();

        let mut replaced = None;
        let parent = match anchor {
            Some(target) if replace => {
                let forwarded = if mode.replace {
                    Some(Conclusion::NoData)
                } else {
                    conclusion.take()
                };
                let parent = self.tree.previous(target);
                self.conclude_up_to(target)?;
                self.conclude_single(target, forwarded)?;
                replaced = Some(target);
                parent
            }
            Some(anchor) => {
                self.conclude_up_to(anchor)?;
                Some(anchor)
            }
            None => None,
        };

        let id = match self.launch_activity_impl(parent, prepared) {
            Ok(id) => id,
            Err(err) => {
                self.restore_active(parent);
                return Err(err);
            }
        };
        self.audit(LifecycleAuditStage::LaunchResolved, Some(id), |event| {
            event
                .detail("placement", json!(mode.placement))
                .detail("parent", json!(parent.map(DriverId::get)))
                .detail("replaced", json!(replaced.map(DriverId::get)));
        });
        Ok(id)
    }

    /// Launch issued through the manager rather than from an activity.
    fn launch_from_outside(&mut self, launch: DeferredActivity) -> Result<DriverId> {
        if self.shared.is_halting() {
            return Err(RuntimeError::Halting);
        }
        let mut launch = launch;
        if launch.spec().ancestors.is_empty() {
            match self.active {
                Some(active) => launch.set_ancestors(self.tree.chain(active)),
                None => {
                    let mode = launch.spec().mode;
                    launch.set_mode(LaunchMode {
                        placement: Placement::Detached,
                        ..mode
                    });
                }
            }
        }
        let id = self
            .resolve_launch(None, launch, None)?
            .ok_or(RuntimeError::Halting)?;
        self.after_work(id);
        Ok(id)
    }

    fn drain_and_stop(&mut self) {
        self.audit(LifecycleAuditStage::HaltStarted, self.active, |event| {
            event.detail("drivers", json!(self.drivers.len()));
        });
        self.log(
            LogLevel::Info,
            TARGET,
            "halt_started",
            [json_kv("drivers", self.drivers.len())],
        );

        while let Some(id) = self.active.or_else(|| self.tree.top()) {
            if let Err(err) = self.conclude_activity_impl(id, None, true) {
                self.log(
                    LogLevel::Error,
                    TARGET,
                    "halt_conclusion_failed",
                    [json_kv("driver", id.get()), json_str("error", err.to_string())],
                );
                break;
            }
        }
        let stragglers: Vec<DriverId> = self.drivers.keys().copied().collect();
        for id in stragglers {
            let _ = self.transition_down_to(id, LifecycleState::Constructed);
            self.drivers.remove(&id);
        }
        self.active = None;

        self.audit(LifecycleAuditStage::HaltCompleted, None, |_| {});
        self.log(LogLevel::Info, TARGET, "halt_completed", []);
        self.shared.stop();
    }

    fn snapshot(&self) -> TreeSnapshot {
        let drivers = self
            .tree
            .below()
            .into_iter()
            .filter_map(|id| {
                let driver = self.drivers.get(&id)?;
                Some(DriverSnapshot {
                    id,
                    application: driver.application.clone(),
                    activity: driver.activity_id.clone(),
                    state: driver.state,
                    ordinal: self.tree.ordinal(id).unwrap_or_default(),
                    previous: self.tree.previous(id),
                    successors: self.tree.successors(id).to_vec(),
                    pending_responses: driver.pending_responses.len(),
                    redraw_armed: driver.timer.is_armed(),
                    request_id: driver.launch.spec().request_id.clone(),
                })
            })
            .collect();
        TreeSnapshot {
            active: self.active,
            roots: self.tree.roots().to_vec(),
            drivers,
        }
    }
}

/// Point-in-time view of one driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriverSnapshot {
    pub id: DriverId,
    pub application: String,
    pub activity: String,
    pub state: LifecycleState,
    pub ordinal: usize,
    pub previous: Option<DriverId>,
    pub successors: Vec<DriverId>,
    pub pending_responses: usize,
    pub redraw_armed: bool,
    pub request_id: Option<String>,
}

/// Point-in-time view of the activity forest, drivers in depth-first order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeSnapshot {
    pub active: Option<DriverId>,
    pub roots: Vec<DriverId>,
    pub drivers: Vec<DriverSnapshot>,
}

impl TreeSnapshot {
    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn get(&self, id: DriverId) -> Option<&DriverSnapshot> {
        self.drivers.iter().find(|driver| driver.id == id)
    }

    /// First driver (depth-first) running `activity`.
    pub fn find(&self, activity: &str) -> Option<&DriverSnapshot> {
        self.drivers.iter().find(|driver| driver.activity == activity)
    }

    pub fn count_in(&self, state: LifecycleState) -> usize {
        self.drivers
            .iter()
            .filter(|driver| driver.state == state)
            .count()
    }

    /// Top of the foreground stack.
    pub fn top(&self) -> Option<DriverId> {
        let mut current = *self.roots.last()?;
        while let Some(next) = self.get(current).and_then(|d| d.successors.last()) {
            current = *next;
        }
        Some(current)
    }
}

/// Cloneable handle for feeding events from any thread.
#[derive(Clone)]
pub struct EventSink {
    shared: Arc<ManagerShared>,
}

impl EventSink {
    /// Queue `event` for the active driver.
    pub fn deliver(&self, event: ActivityEvent) -> Result<()> {
        let job: Job = Box::new(move |core: &mut Core| core.deliver(event));
        self.shared.submit(Admission::Normal, job)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_halting() || self.shared.is_stopped()
    }
}

/// Owner of the activity forest and its worker thread.
pub struct ActivityManager {
    core: Arc<Mutex<Core>>,
    shared: Arc<ManagerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    halt_timeout: Duration,
    poll_interval: Duration,
    logger: Option<Logger>,
    metrics: Option<Arc<Mutex<RuntimeMetrics>>>,
    started_at: Instant,
}

impl ActivityManager {
    /// Start a manager that renders into a [`NullSurface`].
    pub fn new(registry: ActivityRegistry, config: ManagerConfig) -> Result<Self> {
        let surface = Box::new(NullSurface::new(config.screen_size));
        Self::with_surface(registry, config, surface)
    }

    pub fn with_surface(
        registry: ActivityRegistry,
        config: ManagerConfig,
        surface: Box<dyn Surface>,
    ) -> Result<Self> {
        let (shared, ports) = worker::channel(config.redraw_debounce, config.metrics_handle());
        let name = config.worker_name.clone();
        let halt_timeout = config.halt_timeout;
        let poll_interval = config.poll_interval;
        let logger = config.logger.clone();
        let metrics = config.metrics_handle();

        let core = Arc::new(Mutex::new(Core::new(
            registry,
            surface,
            config,
            Arc::clone(&shared),
        )));
        let handle = worker::spawn(&name, Arc::clone(&core), Arc::clone(&shared), ports)?;
        core.lock().log(
            LogLevel::Info,
            TARGET,
            "manager_started",
            [json_str("worker", name)],
        );

        Ok(Self {
            core,
            shared,
            worker: Mutex::new(Some(handle)),
            halt_timeout,
            poll_interval,
            logger,
            metrics,
            started_at: Instant::now(),
        })
    }

    /// Launch the main activity of `application` above the top of the forest,
    /// or as the first root.
    pub fn launch_application(&self, application: &str) -> Result<DriverId> {
        let application = application.to_string();
        self.shared.submit_sync(Admission::Normal, move |core| {
            let main = core.registry.application(&application)?.main_activity.clone();
            let launch = DeferredActivity::new(main)
                .in_application(application)
                .with_mode(LaunchMode::above_top());
            core.launch_from_outside(launch)
        })
    }

    /// Launch a descriptor relative to the active driver. A descriptor that
    /// already carries an ancestor chain is resolved against that chain.
    pub fn launch_activity(&self, launch: DeferredActivity) -> Result<DriverId> {
        self.shared
            .submit_sync(Admission::Normal, move |core| core.launch_from_outside(launch))
    }

    /// Conclude the active driver with `conclusion`.
    pub fn conclude_activity(&self, conclusion: Conclusion) -> Result<()> {
        self.shared.submit_sync(Admission::Draining, move |core| {
            let active = core.active.ok_or(RuntimeError::NoActiveActivity)?;
            core.resolve_conclusion(active, conclusion)
        })
    }

    pub fn deliver_event(&self, event: ActivityEvent) -> Result<()> {
        self.event_sink().deliver(event)
    }

    pub fn event_sink(&self) -> EventSink {
        EventSink {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn logger(&self) -> Option<&Logger> {
        self.logger.as_ref()
    }

    /// Block until every job queued before this call has run.
    pub fn flush(&self) -> Result<()> {
        self.shared.submit_sync(Admission::Draining, |_| Ok(()))
    }

    pub fn snapshot(&self) -> Result<TreeSnapshot> {
        if self.shared.is_worker_thread() {
            return Err(RuntimeError::ReentrantCall);
        }
        Ok(self.core.lock().snapshot())
    }

    pub fn active(&self) -> Result<Option<DriverId>> {
        if self.shared.is_worker_thread() {
            return Err(RuntimeError::ReentrantCall);
        }
        Ok(self.core.lock().active)
    }

    /// Context of a live driver, for use from other threads.
    pub fn context(&self, id: DriverId) -> Result<Option<ActivityContext>> {
        if self.shared.is_worker_thread() {
            return Err(RuntimeError::ReentrantCall);
        }
        Ok(self
            .core
            .lock()
            .drivers
            .get(&id)
            .map(|driver| driver.context.clone()))
    }

    pub fn metrics(&self) -> Option<MetricSnapshot> {
        self.metrics
            .as_ref()
            .map(|metrics| metrics.lock().snapshot(self.started_at.elapsed()))
    }

    pub fn is_halting(&self) -> bool {
        self.shared.is_halting()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Conclude every driver, then stop the worker. Idempotent.
    pub fn halt(&self, timeout: Duration) -> Result<()> {
        if self.shared.is_worker_thread() {
            return Err(RuntimeError::ReentrantCall);
        }
        if !self.shared.is_stopped() && self.shared.begin_halt() {
            let job: Job = Box::new(|core: &mut Core| core.drain_and_stop());
            match self.shared.submit(Admission::Draining, job) {
                Ok(()) | Err(RuntimeError::WorkerStopped) => {}
                Err(err) => return Err(err),
            }
        }
        if !self.shared.wait_stopped(timeout) {
            return Err(RuntimeError::HaltTimeout(timeout));
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for ActivityManager {
    fn drop(&mut self) {
        if self.shared.is_stopped() || self.shared.is_worker_thread() {
            return;
        }
        let _ = self.halt(self.halt_timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyEventState, KeyModifiers};

    use crate::display::{ComponentAction, RedrawDelay};
    use crate::launch::LaunchPayload;
    use crate::logging::MemorySink;
    use crate::runtime::MemoryAudit;
    use crate::activity::{ActivityDefinition, ApplicationDefinition};
    use crate::testing::{Fault, Probe, RecordingActivity, custom, recording};

    const APP: &str = "notes";

    struct Harness {
        manager: ActivityManager,
        probe: Probe,
        audit: Arc<MemoryAudit>,
        logs: MemorySink,
    }

    impl Harness {
        fn snapshot(&self) -> TreeSnapshot {
            self.manager.flush().expect("flush");
            let snapshot = self.manager.snapshot().expect("snapshot");
            assert_single_active(&snapshot);
            snapshot
        }

        fn ctx(&self, id: DriverId) -> ActivityContext {
            self.manager
                .context(id)
                .expect("context")
                .expect("live driver")
        }

        fn launch(&self, activity: &str, mode: LaunchMode) -> DriverId {
            self.manager
                .launch_activity(DeferredActivity::new(activity).in_application(APP).with_mode(mode))
                .expect("launch")
        }
    }

    fn harness_with(
        extra: impl FnOnce(&Probe) -> Vec<ActivityDefinition>,
        tweak: impl FnOnce(ManagerConfig) -> ManagerConfig,
    ) -> Harness {
        let probe = Probe::new();
        let mut app = ApplicationDefinition::new(APP, "home");
        for id in ["home", "list", "detail", "editor"] {
            app = app.with_activity(recording(id, &probe));
        }
        for def in extra(&probe) {
            app = app.with_activity(def);
        }
        let registry = ActivityRegistry::new().with_application(app);
        let audit = Arc::new(MemoryAudit::new());
        let logs = MemorySink::new();
        let mut config = ManagerConfig::default()
            .with_logger(Logger::new(logs.clone()))
            .with_audit(audit.clone());
        config.enable_metrics();
        let manager = ActivityManager::new(registry, tweak(config)).expect("manager");
        Harness {
            manager,
            probe,
            audit,
            logs,
        }
    }

    fn harness() -> Harness {
        harness_with(|_| Vec::new(), |config| config)
    }

    fn assert_single_active(snapshot: &TreeSnapshot) {
        assert!(snapshot.count_in(LifecycleState::Active) <= 1);
        if let Some(active) = snapshot.active {
            assert_eq!(
                snapshot.get(active).map(|d| d.state),
                Some(LifecycleState::Active)
            );
        }
    }

    fn assert_monotonic(audit: &MemoryAudit, id: DriverId) {
        let transitions = audit.transitions_for(id);
        for (from, to) in &transitions {
            assert!(from.is_adjacent(*to), "{from} -> {to} skips a state");
        }
        for pair in transitions.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
    }

    fn payload(key: &str, value: &str) -> LaunchPayload {
        let mut data = LaunchPayload::new();
        data.insert(key.to_string(), json!(value));
        data
    }

    fn key(code: KeyCode) -> ActivityEvent {
        ActivityEvent::Key(KeyEvent {
            code,
            modifiers: KeyModifiers::NONE,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        })
    }

    #[test]
    fn launching_an_application_creates_an_active_root() {
        let h = harness();
        let root = h.manager.launch_application(APP).expect("launch app");
        let snapshot = h.snapshot();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.active, Some(root));
        assert_eq!(snapshot.top(), Some(root));
        assert_eq!(snapshot.roots, vec![root]);
        assert_eq!(
            h.probe.calls_of("home"),
            vec!["init", "open", "activate"]
        );
        assert_eq!(h.probe.renders("home"), 1);
        assert_eq!(
            h.audit.transitions_for(root),
            vec![
                (LifecycleState::Constructed, LifecycleState::Initialized),
                (LifecycleState::Initialized, LifecycleState::Open),
                (LifecycleState::Open, LifecycleState::Active),
            ]
        );
    }

    #[test]
    fn unknown_application_is_rejected() {
        let h = harness();
        assert!(matches!(
            h.manager.launch_application("missing"),
            Err(RuntimeError::UnknownApplication(name)) if name == "missing"
        ));
        assert!(matches!(
            h.manager.launch_activity(DeferredActivity::new("nope").in_application(APP)),
            Err(RuntimeError::UnknownActivity { .. })
        ));
        assert!(h.snapshot().is_empty());
    }

    #[test]
    fn responding_child_returns_data_to_its_parent() {
        let h = harness();
        let root = h.manager.launch_application(APP).expect("root");
        let child = h
            .manager
            .launch_activity(
                DeferredActivity::new("list")
                    .with_mode(LaunchMode::above_current().responding())
                    .with_request_id("pick"),
            )
            .expect("child");

        let snapshot = h.snapshot();
        assert_eq!(snapshot.active, Some(child));
        assert_eq!(snapshot.get(root).map(|d| d.state), Some(LifecycleState::Open));
        assert_eq!(snapshot.get(child).and_then(|d| d.previous), Some(root));

        h.manager
            .conclude_activity(Conclusion::Data(payload("choice", "b")))
            .expect("conclude");
        let snapshot = h.snapshot();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.active, Some(root));
        let responses = h.probe.responses_of("home");
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].from, child);
        assert_eq!(responses[0].request_id.as_deref(), Some("pick"));
        assert_eq!(responses[0].data, payload("choice", "b"));

        // Response arrives before activation.
        let calls = h.probe.calls_of("home");
        let tail = &calls[calls.len() - 3..];
        assert_eq!(tail, ["passivate", "response", "activate"]);
        assert_monotonic(&h.audit, child);
    }

    #[test]
    fn replace_launch_forwards_no_data() {
        let h = harness();
        let root = h.manager.launch_application(APP).expect("root");
        let list = h.launch("list", LaunchMode::above_current().responding());

        let ctx = h.ctx(list);
        ctx.call(|scope| {
            let ctx = scope.context();
            ctx.request_conclusion(Conclusion::Data(payload("ignored", "yes")));
            ctx.request_launch(
                DeferredActivity::new("detail").with_mode(LaunchMode::above_current().replacing()),
            )
            .map_err(|err| ActivityError::msg(err.to_string()))
        })
        .expect("stage");

        let snapshot = h.snapshot();
        let detail = snapshot.find("detail").expect("detail launched");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(detail.previous, Some(root));
        assert_eq!(snapshot.active, Some(detail.id));
        assert!(snapshot.get(list).is_none());
        assert_eq!(snapshot.get(root).map(|d| d.pending_responses), Some(0));
    }

    #[test]
    fn pending_conclusion_turns_launch_into_replacement() {
        let h = harness();
        let root = h.manager.launch_application(APP).expect("root");
        let list = h.launch("list", LaunchMode::above_current().responding());

        h.ctx(list)
            .call(|scope| {
                let ctx = scope.context();
                ctx.request_conclusion(Conclusion::Data(payload("k", "v")));
                ctx.request_launch(DeferredActivity::new("detail"))
                    .map_err(|err| ActivityError::msg(err.to_string()))
            })
            .expect("stage");

        let snapshot = h.snapshot();
        let detail = snapshot.find("detail").expect("detail");
        assert_eq!(detail.previous, Some(root));
        assert!(snapshot.get(list).is_none());
        // The requester's own conclusion value is forwarded, queued until the
        // root activates again.
        assert_eq!(snapshot.get(root).map(|d| d.pending_responses), Some(1));
        assert!(h.probe.responses_of("home").is_empty());
    }

    #[test]
    fn accepted_relaunch_reuses_the_ancestor() {
        let state = payload("scroll", "42");
        let offered = state.clone();
        let h = harness_with(
            move |probe| {
                vec![custom("board", probe, move |activity| {
                    activity.accepting_relaunch(offered.clone())
                })]
            },
            |config| config,
        );

        h.manager.launch_application(APP).expect("root");
        let board = h.launch("board", LaunchMode::above_current());
        let detail = h.launch("detail", LaunchMode::above_current());

        h.ctx(detail)
            .request_launch(
                DeferredActivity::new("board")
                    .with_mode(LaunchMode::above_current().relaunching())
                    .with_request_id("again"),
            )
            .expect("stage relaunch");

        let snapshot = h.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.active, Some(board));
        assert!(snapshot.get(detail).is_none());
        assert_eq!(
            snapshot.get(board).and_then(|d| d.request_id.clone()),
            Some("again".to_string())
        );
        assert_eq!(h.probe.opened_with("board").last(), Some(&Some(state)));
        assert_eq!(h.audit.count(LifecycleAuditStage::RelaunchAccepted), 1);
        assert_monotonic(&h.audit, board);
    }

    #[test]
    fn refused_relaunch_falls_back_to_fresh_launch() {
        let h = harness();
        h.manager.launch_application(APP).expect("root");
        let list = h.launch("list", LaunchMode::above_current());
        let detail = h.launch("detail", LaunchMode::above_current());

        h.ctx(detail)
            .request_launch(
                DeferredActivity::new("list").with_mode(LaunchMode::above_current().relaunching()),
            )
            .expect("stage");

        let snapshot = h.snapshot();
        assert_eq!(h.audit.count(LifecycleAuditStage::RelaunchRefused), 1);
        let lists: Vec<_> = snapshot
            .drivers
            .iter()
            .filter(|d| d.activity == "list")
            .collect();
        assert_eq!(lists.len(), 2);
        let fresh = lists.iter().find(|d| d.id != list).expect("fresh list");
        assert_eq!(snapshot.active, Some(fresh.id));
        assert_eq!(fresh.previous, Some(list));
        assert!(snapshot.get(detail).is_none());
    }

    #[test]
    fn accepted_relaunch_blocks_own_conclusion() {
        let h = harness_with(
            |probe| {
                vec![custom("board", probe, |activity| {
                    activity.accepting_relaunch(LaunchPayload::new())
                })]
            },
            |config| config,
        );

        h.manager.launch_application(APP).expect("root");
        let board = h.launch("board", LaunchMode::above_current().responding());
        h.ctx(board)
            .call(|scope| {
                let ctx = scope.context();
                ctx.request_conclusion(Conclusion::Data(payload("k", "v")));
                ctx.request_launch(
                    DeferredActivity::new("board").with_mode(LaunchMode::above_current().relaunching()),
                )
                .map_err(|err| ActivityError::msg(err.to_string()))
            })
            .expect("stage");

        let snapshot = h.snapshot();
        assert_eq!(snapshot.active, Some(board));
        assert_eq!(snapshot.len(), 2);
        assert!(h.probe.responses_of("home").is_empty());
    }

    #[test]
    fn sole_root_cannot_be_concluded() {
        let h = harness();
        let root = h.manager.launch_application(APP).expect("root");
        let before = h.snapshot();

        assert!(matches!(
            h.manager.conclude_activity(Conclusion::NoData),
            Err(RuntimeError::RootConclusion)
        ));
        assert_eq!(h.snapshot(), before);
        assert_eq!(h.audit.count(LifecycleAuditStage::ConclusionRefused), 1);
        assert_eq!(h.snapshot().active, Some(root));
    }

    #[test]
    fn conclude_without_active_driver_fails() {
        let h = harness();
        assert!(matches!(
            h.manager.conclude_activity(Conclusion::NoData),
            Err(RuntimeError::NoActiveActivity)
        ));
    }

    #[test]
    fn failing_activity_still_completes_its_lifecycle() {
        let h = harness_with(
            |probe| {
                vec![
                    custom("crashy", probe, |activity| activity.failing(Fault::Panic)),
                    custom("grumpy", probe, |activity| activity.failing(Fault::Error)),
                ]
            },
            |config| config,
        );

        let root = h.manager.launch_application(APP).expect("root");
        let crashy = h.launch("crashy", LaunchMode::above_current());
        assert_eq!(
            h.snapshot().get(crashy).map(|d| d.state),
            Some(LifecycleState::Active)
        );
        h.manager.conclude_activity(Conclusion::NoData).expect("conclude");

        let grumpy = h.launch("grumpy", LaunchMode::above_current());
        h.manager.conclude_activity(Conclusion::NoData).expect("conclude");

        let snapshot = h.snapshot();
        assert_eq!(snapshot.active, Some(root));
        for id in [crashy, grumpy] {
            assert_monotonic(&h.audit, id);
            assert_eq!(h.audit.transitions_for(id).len(), 6);
        }
        assert!(h.audit.count(LifecycleAuditStage::ActivityFault) >= 12);
        assert!(h
            .logs
            .messages()
            .iter()
            .any(|m| m == "activity exception during constructed"));
        let metrics = h.manager.metrics().expect("metrics enabled");
        assert!(metrics.activity_faults >= 12);
        // Crashy opened without a display; the default one rendered its title.
        assert!(h.probe.renders("crashy") == 0);
    }

    #[test]
    fn unresolvable_requester_fails_loudly() {
        let h = harness();
        let root = h.manager.launch_application(APP).expect("root");
        let stale = DeferredActivity::from_spec(crate::launch::LaunchSpec {
            ancestors: vec![DriverId::new(99)],
            application: Some(APP.to_string()),
            ..crate::launch::LaunchSpec::new("list")
        });
        assert!(matches!(
            h.manager.launch_activity(stale),
            Err(RuntimeError::UnresolvableRequester(chain)) if chain == vec![DriverId::new(99)]
        ));
        assert_eq!(h.audit.count(LifecycleAuditStage::LaunchRefused), 1);
        assert!(h.logs.messages().iter().any(|m| m == "launch_refused"));
        let snapshot = h.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.active, Some(root));
    }

    #[test]
    fn failed_replacing_launch_keeps_the_requester_active() {
        let h = harness();
        let root = h.manager.launch_application(APP).expect("root");
        let list = h.launch("list", LaunchMode::above_current());

        h.ctx(list)
            .request_launch(
                DeferredActivity::new("ghost").with_mode(LaunchMode::above_current().replacing()),
            )
            .expect("stage");

        let snapshot = h.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.active, Some(list));
        assert_eq!(snapshot.get(list).map(|d| d.state), Some(LifecycleState::Active));
        assert_eq!(snapshot.get(root).map(|d| d.state), Some(LifecycleState::Open));
        assert!(h
            .logs
            .messages()
            .iter()
            .any(|m| m == "request_resolution_failed"));
        assert_eq!(h.probe.count("list:close"), 0);
    }

    #[test]
    fn failed_launch_above_top_leaves_the_stack_alone() {
        let h = harness();
        h.manager.launch_application(APP).expect("root");
        let list = h.launch("list", LaunchMode::above_current());
        let detail = h.launch("detail", LaunchMode::above_current());

        h.ctx(list)
            .request_launch(DeferredActivity::new("ghost").with_mode(LaunchMode::above_top()))
            .expect("stage");

        let snapshot = h.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.active, Some(detail));
        assert_eq!(h.probe.count("detail:passivate"), 0);
    }

    #[test]
    fn panicking_factory_does_not_tear_down_the_requester() {
        let h = harness_with(
            |_| {
                vec![ActivityDefinition::from_fn("boom", "BOOM", || -> RecordingActivity {
                    panic!("factory exploded")
                })]
            },
            |config| config,
        );
        h.manager.launch_application(APP).expect("root");
        let list = h.launch("list", LaunchMode::above_current());

        h.ctx(list)
            .request_launch(
                DeferredActivity::new("boom").with_mode(LaunchMode::above_current().replacing()),
            )
            .expect("stage");

        let snapshot = h.snapshot();
        assert_eq!(snapshot.active, Some(list));
        assert!(snapshot.find("boom").is_none());
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn failed_launch_still_honours_the_staged_conclusion() {
        let h = harness();
        let root = h.manager.launch_application(APP).expect("root");
        let list = h.launch("list", LaunchMode::above_current().responding());

        h.ctx(list)
            .call(|scope| {
                let ctx = scope.context();
                ctx.request_conclusion(Conclusion::Data(payload("k", "v")));
                ctx.request_launch(DeferredActivity::new("ghost"))
                    .map_err(|err| ActivityError::msg(err.to_string()))
            })
            .expect("stage");

        let snapshot = h.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.active, Some(root));
        assert_eq!(h.probe.responses_of("home").len(), 1);
    }

    #[test]
    fn conclusion_with_launch_above_another_top_concludes_only_the_requester() {
        let h = harness();
        let root = h.manager.launch_application(APP).expect("root");
        let list = h.launch("list", LaunchMode::above_current().responding());
        let detail = h.launch("detail", LaunchMode::above_current());

        h.ctx(list)
            .call(|scope| {
                let ctx = scope.context();
                ctx.request_conclusion(Conclusion::Data(payload("picked", "x")));
                ctx.request_launch(DeferredActivity::new("editor").with_mode(LaunchMode::above_top()))
                    .map_err(|err| ActivityError::msg(err.to_string()))
            })
            .expect("stage");

        let snapshot = h.snapshot();
        assert!(snapshot.get(list).is_none());
        assert!(snapshot.get(detail).is_none());
        let editor = snapshot.find("editor").expect("editor");
        assert_eq!(editor.previous, Some(root));
        assert_eq!(snapshot.active, Some(editor.id));
        assert_eq!(snapshot.len(), 2);

        // The requester's data reached the root while it was briefly active.
        let responses = h.probe.responses_of("home");
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].from, list);
        assert_monotonic(&h.audit, root);
    }

    #[test]
    fn detached_launch_starts_a_new_stack() {
        let h = harness();
        let root = h.manager.launch_application(APP).expect("root");
        let other = h.launch("editor", LaunchMode::detached());

        let snapshot = h.snapshot();
        assert_eq!(snapshot.roots, vec![root, other]);
        assert_eq!(snapshot.active, Some(other));
        assert_eq!(snapshot.get(root).map(|d| d.state), Some(LifecycleState::Open));

        // Not the sole root, so it may conclude; the remaining stack takes over.
        h.manager.conclude_activity(Conclusion::NoData).expect("conclude");
        let snapshot = h.snapshot();
        assert_eq!(snapshot.roots, vec![root]);
        assert_eq!(snapshot.active, Some(root));
    }

    #[test]
    fn launch_above_top_lands_on_foreground_stack() {
        let h = harness();
        h.manager.launch_application(APP).expect("root");
        let list = h.launch("list", LaunchMode::above_current());
        let again = h.manager.launch_application(APP).expect("second home");
        let snapshot = h.snapshot();
        assert_eq!(snapshot.get(again).and_then(|d| d.previous), Some(list));
        assert_eq!(snapshot.get(again).map(|d| d.ordinal), Some(2));
    }

    #[test]
    fn second_pending_launch_is_rejected() {
        let h = harness();
        let root = h.manager.launch_application(APP).expect("root");
        let rejected = h
            .ctx(root)
            .call(|scope| {
                let ctx = scope.context();
                ctx.request_launch(DeferredActivity::new("list"))
                    .map_err(|err| ActivityError::msg(err.to_string()))?;
                Ok(matches!(
                    ctx.request_launch(DeferredActivity::new("detail")),
                    Err(RuntimeError::LaunchAlreadyPending(_))
                ))
            })
            .expect("call");
        assert!(rejected);
        let snapshot = h.snapshot();
        assert!(snapshot.find("list").is_some());
        assert!(snapshot.find("detail").is_none());
    }

    #[test]
    fn last_conclusion_wins() {
        let h = harness();
        let root = h.manager.launch_application(APP).expect("root");
        let list = h.launch("list", LaunchMode::above_current().responding());
        h.ctx(list)
            .call(|scope| {
                let ctx = scope.context();
                ctx.request_conclusion(Conclusion::Data(payload("n", "first")));
                ctx.request_conclusion(Conclusion::Data(payload("n", "second")));
                Ok(())
            })
            .expect("call");
        assert_eq!(h.snapshot().active, Some(root));
        let responses = h.probe.responses_of("home");
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].data, payload("n", "second"));
    }

    #[test]
    fn launch_requested_during_activation_is_chained() {
        let h = harness_with(
            |probe| {
                vec![custom("splash", probe, |activity| {
                    let mut fired = false;
                    activity.on_activate(move |ctx| {
                        if !fired {
                            fired = true;
                            let _ = ctx.request_launch(
                                DeferredActivity::new("home")
                                    .with_mode(LaunchMode::above_current().replacing()),
                            );
                        }
                    })
                })]
            },
            |config| config,
        );

        let splash = h.launch("splash", LaunchMode::detached());
        let snapshot = h.snapshot();
        assert!(snapshot.get(splash).is_none());
        let home = snapshot.find("home").expect("home");
        assert_eq!(snapshot.active, Some(home.id));
        assert_eq!(snapshot.roots, vec![home.id]);
    }

    #[test]
    fn escape_concludes_non_root_drivers() {
        let h = harness();
        let root = h.manager.launch_application(APP).expect("root");
        h.launch("list", LaunchMode::above_current());

        h.manager.deliver_event(key(KeyCode::Char('x'))).expect("deliver");
        h.manager.deliver_event(key(KeyCode::Esc)).expect("deliver");
        let snapshot = h.snapshot();
        assert_eq!(snapshot.active, Some(root));
        assert_eq!(h.probe.count("list:event"), 2);

        // Esc on the root is ignored by the default handler.
        h.manager.deliver_event(key(KeyCode::Esc)).expect("deliver");
        assert_eq!(h.snapshot().active, Some(root));
        assert_eq!(h.manager.metrics().map(|m| m.events), Some(3));
    }

    #[test]
    fn component_actions_are_applied_after_render() {
        let h = harness_with(
            |probe| {
                vec![custom("picker", probe, |activity| {
                    activity.emitting(ComponentAction::Conclude(Conclusion::Data(payload(
                        "c", "1",
                    ))))
                })]
            },
            |config| config,
        );

        let root = h.manager.launch_application(APP).expect("root");
        h.launch("picker", LaunchMode::above_current().responding());
        assert_eq!(h.snapshot().active, Some(root));
        assert_eq!(h.probe.responses_of("home").len(), 1);
    }

    #[test]
    fn perform_runs_on_worker_and_exposes_the_activity() {
        let h = harness();
        let root = h.manager.launch_application(APP).expect("root");
        let ctx = h.ctx(root);
        assert!(!ctx.is_worker_thread());

        let value = ctx
            .perform(|scope| {
                assert!(scope.context().is_worker_thread());
                assert_eq!(scope.state(), LifecycleState::Active);
                let activity = scope
                    .activity::<RecordingActivity>()
                    .ok_or_else(|| ActivityError::msg("wrong type"))?;
                activity.counter += 5;
                Ok(activity.counter)
            })
            .wait()
            .expect("perform");
        assert_eq!(value, 5);

        let failed = ctx.call(|_| -> ActivityResult<()> { Err(ActivityError::msg("nope")) });
        assert!(matches!(failed, Err(RuntimeError::Activity(_))));
        let panicked = ctx.call(|_| -> ActivityResult<()> { panic!("kaboom") });
        assert!(matches!(panicked, Err(RuntimeError::WorkPanicked(m)) if m == "kaboom"));
    }

    #[test]
    fn synchronous_calls_from_the_worker_are_refused() {
        let h = harness();
        let root = h.manager.launch_application(APP).expect("root");
        let nested = h
            .ctx(root)
            .call(|scope| {
                let inner = scope.context().call(|_| Ok(()));
                Ok(matches!(inner, Err(RuntimeError::ReentrantCall)))
            })
            .expect("call");
        assert!(nested);
    }

    #[test]
    fn spawn_load_applies_on_the_worker() {
        let h = harness();
        let root = h.manager.launch_application(APP).expect("root");
        let ctx = h.ctx(root);

        // Issued from the worker: loader runs on a background thread.
        let completion = ctx
            .call(|scope| {
                let worker = thread::current().id();
                Ok(scope.context().spawn_load(
                    move || {
                        assert_ne!(thread::current().id(), worker);
                        Ok(7u32)
                    },
                    |scope, loaded| {
                        let activity = scope
                            .activity::<RecordingActivity>()
                            .ok_or_else(|| ActivityError::msg("wrong type"))?;
                        activity.counter = loaded?;
                        Ok(())
                    },
                ))
            })
            .expect("call");
        completion.wait().expect("load");

        // Issued elsewhere: loader runs inline.
        ctx.spawn_load(|| Ok(3u32), |scope, loaded| {
            let activity = scope
                .activity::<RecordingActivity>()
                .ok_or_else(|| ActivityError::msg("wrong type"))?;
            activity.counter += loaded?;
            Ok(())
        })
        .wait()
        .expect("inline load");

        let counter = ctx
            .call(|scope| {
                Ok(scope
                    .activity::<RecordingActivity>()
                    .map(|a| a.counter)
                    .unwrap_or_default())
            })
            .expect("read");
        assert_eq!(counter, 10);
    }

    #[test]
    fn background_redraw_requests_are_debounced() {
        let h = harness_with(
            |_| Vec::new(),
            |config| config.with_redraw_debounce(Duration::from_millis(40)),
        );
        let root = h.manager.launch_application(APP).expect("root");
        h.snapshot();
        assert_eq!(h.probe.renders("home"), 1);

        let ctx = h.ctx(root);
        ctx.request_redraw();
        ctx.request_redraw();
        thread::sleep(Duration::from_millis(150));
        h.snapshot();

        assert_eq!(h.probe.renders("home"), 2);
        assert_eq!(h.manager.metrics().map(|m| m.debounced_redraws), Some(1));
    }

    #[test]
    fn worker_redraw_requests_render_once_after_the_unit() {
        let h = harness();
        let root = h.manager.launch_application(APP).expect("root");
        h.ctx(root)
            .call(|scope| {
                scope.context().request_redraw();
                scope.context().request_redraw();
                Ok(())
            })
            .expect("call");
        h.snapshot();
        assert_eq!(h.probe.renders("home"), 2);
    }

    #[test]
    fn delayed_redraw_timer_rearms_and_stops_on_passivate() {
        let h = harness_with(
            |probe| {
                vec![custom("ticker", probe, |activity| {
                    activity.redrawing(RedrawDelay::After(Duration::from_millis(15)))
                })]
            },
            |config| config,
        );

        h.manager.launch_application(APP).expect("root");
        let ticker = h.launch("ticker", LaunchMode::above_current());
        thread::sleep(Duration::from_millis(120));
        assert!(h.probe.renders("ticker") >= 3);
        assert_eq!(h.snapshot().get(ticker).map(|d| d.redraw_armed), Some(true));

        h.launch("list", LaunchMode::above_current());
        let snapshot = h.snapshot();
        assert_eq!(snapshot.get(ticker).map(|d| d.redraw_armed), Some(false));
        let frozen = h.probe.renders("ticker");
        thread::sleep(Duration::from_millis(60));
        assert_eq!(h.probe.renders("ticker"), frozen);
    }

    #[test]
    fn periodic_redraw_follows_the_context_schedule() {
        let h = harness();
        let root = h.manager.launch_application(APP).expect("root");
        h.ctx(root).schedule_redraw_every(Duration::from_millis(15));
        thread::sleep(Duration::from_millis(120));
        assert!(h.probe.renders("home") >= 4);

        h.ctx(root).cancel_scheduled_redraw();
        h.snapshot();
        let frozen = h.probe.renders("home");
        thread::sleep(Duration::from_millis(50));
        assert_eq!(h.probe.renders("home"), frozen);
    }

    #[test]
    fn halt_concludes_everything_and_is_idempotent() {
        let h = harness();
        let root = h.manager.launch_application(APP).expect("root");
        let list = h.launch("list", LaunchMode::above_current());
        let detail = h.launch("detail", LaunchMode::above_current());

        h.manager.halt(Duration::from_secs(2)).expect("halt");
        h.manager.halt(Duration::from_secs(2)).expect("second halt");
        assert!(h.manager.is_stopped());

        for id in [root, list, detail] {
            assert_monotonic(&h.audit, id);
            assert_eq!(
                h.audit.transitions_for(id).last(),
                Some(&(LifecycleState::Initialized, LifecycleState::Constructed))
            );
        }
        let stages = h.audit.stages();
        assert_eq!(stages.last(), Some(&LifecycleAuditStage::HaltCompleted));
        assert!(h.manager.snapshot().expect("snapshot").is_empty());

        assert!(matches!(
            h.manager.launch_application(APP),
            Err(RuntimeError::Halting | RuntimeError::WorkerStopped)
        ));
        assert!(h.manager.deliver_event(key(KeyCode::Enter)).is_err());
    }

    #[test]
    fn launches_staged_while_halting_are_dropped() {
        let h = harness();
        let root = h.manager.launch_application(APP).expect("root");
        let ctx = h.ctx(root);
        h.manager.halt(Duration::from_secs(2)).expect("halt");
        assert!(ctx.is_halting());
        assert!(ctx.request_launch(DeferredActivity::new("list")).is_ok());
        assert!(!ctx.has_pending_launch());
    }

    #[test]
    fn metrics_snapshots_are_logged_on_interval() {
        let h = harness_with(|_| Vec::new(), |mut config| {
            config.metrics_interval = Duration::from_millis(20);
            config
        });
        h.manager.launch_application(APP).expect("root");
        thread::sleep(Duration::from_millis(80));
        h.snapshot();
        let metric_events = h
            .logs
            .events()
            .into_iter()
            .filter(|event| event.target == "room::activity.metrics")
            .count();
        assert!(metric_events >= 1);
    }
}
