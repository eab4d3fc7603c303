//! Per-activity driver and its state machine.
//!
//! A [`Driver`] owns one activity instance, its display for the current open
//! period, its redraw timer and its input filter. Transitions are implemented
//! on the worker-owned [`Core`] because stepping a driver touches the tree and
//! the active pointer as well as the driver itself.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use crossterm::event::{KeyCode, KeyEventKind};
use serde_json::json;

use crate::activity::{Activity, ActivityResponse, DriverId, LifecycleState, SavedState};
use crate::display::{ComponentAction, DefaultDisplay, Display, Frame, RedrawDelay};
use crate::error::{ActivityResult, Result, RuntimeError};
use crate::launch::{Conclusion, DeferredActivity};
use crate::logging::{LogLevel, json_kv, json_str};

use super::audit::LifecycleAuditStage;
use super::context::ActivityContext;
use super::input::{InputFilter, InputFilterConfig};
use super::manager::Core;
use super::worker::Admission;
use super::{ActivityEvent, EventFlow};

const TARGET: &str = "room::activity.driver";

/// Absolute redraw deadline plus an optional re-arm period.
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct RedrawTimer {
    target: Option<Instant>,
    period: Duration,
}

impl RedrawTimer {
    /// Arm at `at` unless an earlier deadline is already set.
    fn arm_earlier(&mut self, at: Instant) {
        if self.target.is_none_or(|current| at < current) {
            self.target = Some(at);
        }
    }

    fn arm_periodic(&mut self, first: Instant, period: Duration) {
        self.target = Some(first);
        self.period = period;
    }

    pub(super) fn cancel(&mut self) {
        self.target = None;
        self.period = Duration::ZERO;
    }

    pub(super) fn target(&self) -> Option<Instant> {
        self.target
    }

    pub(super) fn is_armed(&self) -> bool {
        self.target.is_some()
    }

    fn is_due(&self, now: Instant) -> bool {
        self.target.is_some_and(|target| target <= now)
    }

    /// Consume the deadline, re-arming when periodic.
    fn fire(&mut self, now: Instant) {
        self.target = match (self.target, self.period.is_zero()) {
            (Some(target), false) => {
                let next = target + self.period;
                Some(if next <= now { now + self.period } else { next })
            }
            _ => None,
        };
    }
}

pub(super) struct Driver {
    pub(super) id: DriverId,
    /// Parent recorded at creation; the tree owns the live link once attached.
    pub(super) parent: Option<DriverId>,
    pub(super) state: LifecycleState,
    pub(super) launch: DeferredActivity,
    pub(super) application: String,
    pub(super) activity_id: String,
    pub(super) title: String,
    pub(super) activity: Box<dyn Activity>,
    pub(super) display: Option<Box<dyn Display>>,
    pub(super) saved_state: Option<SavedState>,
    pub(super) pending_responses: VecDeque<ActivityResponse>,
    pub(super) timer: RedrawTimer,
    input: InputFilter,
    pub(super) context: ActivityContext,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        id: DriverId,
        parent: Option<DriverId>,
        application: String,
        title: String,
        launch: DeferredActivity,
        activity: Box<dyn Activity>,
        context: ActivityContext,
        input: InputFilterConfig,
    ) -> Self {
        let activity_id = launch.spec().activity.clone();
        Self {
            id,
            parent,
            state: LifecycleState::Constructed,
            launch,
            application,
            activity_id,
            title,
            activity,
            display: None,
            saved_state: None,
            pending_responses: VecDeque::new(),
            timer: RedrawTimer::default(),
            input: InputFilter::new(input),
            context,
        }
    }
}

/// Run application code, converting errors and panics into a fault message.
pub(super) fn invoke<T>(call: impl FnOnce() -> ActivityResult<T>) -> std::result::Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.to_string()),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

pub(super) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Core {
    /// Log, count and audit a failed activity callback.
    pub(super) fn fault(
        &self,
        id: DriverId,
        state: LifecycleState,
        stage: &'static str,
        message: String,
    ) {
        self.log(
            LogLevel::Error,
            TARGET,
            &format!("activity exception during {state}"),
            [
                json_kv("driver", id.get()),
                json_str("callback", stage),
                json_str("error", message.clone()),
            ],
        );
        self.record(|metrics| metrics.record_fault());
        self.audit(LifecycleAuditStage::ActivityFault, Some(id), |event| {
            event
                .detail("callback", json!(stage))
                .detail("state", json!(state.as_str()))
                .detail("error", json!(message));
        });
    }

    fn absorb<T>(
        &self,
        id: DriverId,
        state: LifecycleState,
        stage: &'static str,
        outcome: std::result::Result<T, String>,
    ) -> Option<T> {
        match outcome {
            Ok(value) => Some(value),
            Err(message) => {
                self.fault(id, state, stage, message);
                None
            }
        }
    }

    fn driver_mut(&mut self, id: DriverId) -> Result<&mut Driver> {
        self.drivers
            .get_mut(&id)
            .ok_or(RuntimeError::UnknownDriver(id))
    }

    pub(super) fn state_of(&self, id: DriverId) -> Option<LifecycleState> {
        self.drivers.get(&id).map(|driver| driver.state)
    }

    /// Move `id` exactly one step to `to`.
    pub(super) fn step(&mut self, id: DriverId, to: LifecycleState) -> Result<()> {
        let from = self.driver_mut(id)?.state;
        if !from.is_adjacent(to) {
            return Err(RuntimeError::IllegalTransition {
                driver: id,
                from,
                to,
            });
        }

        match (from, to) {
            (LifecycleState::Constructed, LifecycleState::Initialized) => self.step_init(id)?,
            (LifecycleState::Initialized, LifecycleState::Open) => self.step_open(id)?,
            (LifecycleState::Open, LifecycleState::Active) => self.step_activate(id)?,
            (LifecycleState::Active, LifecycleState::Open) => self.step_passivate(id)?,
            (LifecycleState::Open, LifecycleState::Initialized) => self.step_close(id)?,
            (LifecycleState::Initialized, LifecycleState::Constructed) => self.step_destroy(id)?,
            _ => unreachable!("adjacency checked above"),
        }

        self.driver_mut(id)?.state = to;
        self.audit(LifecycleAuditStage::StateChanged, Some(id), |event| {
            event.transition(from, to);
        });
        self.log(
            LogLevel::Trace,
            TARGET,
            "state_changed",
            [
                json_kv("driver", id.get()),
                json_str("from", from.as_str()),
                json_str("to", to.as_str()),
            ],
        );

        if to == LifecycleState::Active {
            self.redraw(id);
        }
        Ok(())
    }

    pub(super) fn transition_up_to(&mut self, id: DriverId, target: LifecycleState) -> Result<()> {
        while let Some(state) = self.state_of(id) {
            if state >= target {
                return Ok(());
            }
            let next = state.next().ok_or(RuntimeError::IllegalTransition {
                driver: id,
                from: state,
                to: target,
            })?;
            self.step(id, next)?;
        }
        Err(RuntimeError::UnknownDriver(id))
    }

    pub(super) fn transition_down_to(&mut self, id: DriverId, target: LifecycleState) -> Result<()> {
        while let Some(state) = self.state_of(id) {
            if state <= target {
                return Ok(());
            }
            let prev = state.prev().ok_or(RuntimeError::IllegalTransition {
                driver: id,
                from: state,
                to: target,
            })?;
            self.step(id, prev)?;
        }
        Err(RuntimeError::UnknownDriver(id))
    }

    fn step_init(&mut self, id: DriverId) -> Result<()> {
        let parent = self.driver_mut(id)?.parent;
        self.tree.attach(id, parent)?;

        let driver = self.driver_mut(id)?;
        let ctx = driver.context.clone();
        let outcome = invoke(|| driver.activity.init(&ctx));
        self.absorb(id, LifecycleState::Constructed, "init", outcome);
        Ok(())
    }

    fn step_open(&mut self, id: DriverId) -> Result<()> {
        let driver = self.driver_mut(id)?;
        let ctx = driver.context.clone();
        let saved = driver.saved_state.take();
        let outcome = invoke(|| driver.activity.open(&ctx, saved));
        let display = self
            .absorb(id, LifecycleState::Initialized, "open", outcome)
            .flatten();

        let driver = self.driver_mut(id)?;
        let display = display.unwrap_or_else(|| Box::new(DefaultDisplay::new(driver.title.clone())));
        driver.display = Some(display);
        Ok(())
    }

    fn step_activate(&mut self, id: DriverId) -> Result<()> {
        let driver = self.driver_mut(id)?;
        let ctx = driver.context.clone();
        let mut outcomes = Vec::new();

        if let Some(display) = driver.display.as_mut() {
            outcomes.push((
                "capture_resources",
                invoke(|| {
                    display.capture_resources();
                    Ok(())
                }),
            ));
        }
        while let Some(response) = driver.pending_responses.pop_front() {
            outcomes.push((
                "on_response",
                invoke(|| driver.activity.on_response(&ctx, response)),
            ));
        }
        outcomes.push(("activate", invoke(|| driver.activity.activate(&ctx))));
        driver.input.reset();

        for (stage, outcome) in outcomes {
            self.absorb(id, LifecycleState::Open, stage, outcome);
        }
        Ok(())
    }

    fn step_passivate(&mut self, id: DriverId) -> Result<()> {
        let driver = self.driver_mut(id)?;
        let ctx = driver.context.clone();
        let passivated = invoke(|| driver.activity.passivate(&ctx));
        driver.timer.cancel();
        let released = match driver.display.as_mut() {
            Some(display) => invoke(|| {
                display.release_resources();
                Ok(())
            }),
            None => Ok(()),
        };

        self.absorb(id, LifecycleState::Active, "passivate", passivated);
        self.absorb(id, LifecycleState::Active, "release_resources", released);
        Ok(())
    }

    fn step_close(&mut self, id: DriverId) -> Result<()> {
        let driver = self.driver_mut(id)?;
        let ctx = driver.context.clone();
        let mut output = SavedState::new();
        let closed = invoke(|| driver.activity.close(&ctx, &mut output));
        driver.saved_state = Some(output);
        let destroyed = match driver.display.take() {
            Some(mut display) => invoke(|| {
                display.destroy();
                Ok(())
            }),
            None => Ok(()),
        };

        self.absorb(id, LifecycleState::Open, "close", closed);
        self.absorb(id, LifecycleState::Open, "display_destroy", destroyed);
        Ok(())
    }

    fn step_destroy(&mut self, id: DriverId) -> Result<()> {
        if self.tree.contains(id) {
            self.tree.detach(id)?;
        }

        let driver = self.driver_mut(id)?;
        let ctx = driver.context.clone();
        let outcome = invoke(|| driver.activity.destroy(&ctx));
        self.absorb(id, LifecycleState::Initialized, "destroy", outcome);
        Ok(())
    }

    /// Render the active driver and schedule its next redraw.
    pub(super) fn redraw(&mut self, id: DriverId) {
        if self.shared.is_halting() || self.active != Some(id) {
            return;
        }
        let size = self.surface.size();
        let Some(driver) = self.drivers.get_mut(&id) else {
            return;
        };
        if driver.state != LifecycleState::Active {
            return;
        }
        let Some(display) = driver.display.as_mut() else {
            return;
        };

        let mut frame = Frame::new(size);
        let rendered = invoke(|| display.render(&mut frame));
        if self
            .absorb(id, LifecycleState::Active, "render", rendered)
            .is_some()
        {
            if let Err(err) = self.surface.present(&frame) {
                self.log(
                    LogLevel::Warn,
                    TARGET,
                    "present_failed",
                    [json_kv("driver", id.get()), json_str("error", err.to_string())],
                );
            }
            self.record(|metrics| metrics.record_redraw());
            self.audit(LifecycleAuditStage::RedrawCommitted, Some(id), |_| {});
        }

        self.drain_component_actions(id);
        self.schedule_delayed_redraw(id, Instant::now());
    }

    /// Follow-up redraw policy after a render.
    fn schedule_delayed_redraw(&mut self, id: DriverId, now: Instant) {
        let Some(display) = self
            .drivers
            .get_mut(&id)
            .and_then(|driver| driver.display.as_mut())
        else {
            return;
        };
        let asked = invoke(|| Ok(display.next_redraw_delay(now)));
        let Some(delay) = self.absorb(id, LifecycleState::Active, "next_redraw_delay", asked) else {
            return;
        };

        match delay {
            RedrawDelay::Immediate => {
                let job = Box::new(move |core: &mut Core| core.redraw(id));
                // Refused only while halting, when redraws stop anyway.
                let _ = self.shared.submit(Admission::Normal, job);
            }
            RedrawDelay::After(wait) => {
                if let Some(driver) = self.drivers.get_mut(&id) {
                    driver.timer.arm_earlier(now + wait);
                }
            }
            RedrawDelay::Idle => {}
        }
    }

    pub(super) fn arm_timer(&mut self, id: DriverId, first: Instant, period: Duration) {
        let Some(driver) = self.drivers.get_mut(&id) else {
            return;
        };
        if driver.state != LifecycleState::Active {
            return;
        }
        if period.is_zero() {
            driver.timer.arm_earlier(first);
        } else {
            driver.timer.arm_periodic(first, period);
        }
    }

    pub(super) fn cancel_timer(&mut self, id: DriverId) {
        if let Some(driver) = self.drivers.get_mut(&id) {
            driver.timer.cancel();
        }
    }

    /// Fire the active driver's timer if its deadline passed.
    pub(super) fn fire_due_timer(&mut self, now: Instant) {
        let Some(id) = self.active else {
            return;
        };
        let Some(driver) = self.drivers.get_mut(&id) else {
            return;
        };
        if !driver.timer.is_due(now) {
            return;
        }
        driver.timer.fire(now);
        self.redraw(id);
    }

    pub(super) fn debounced_redraw(&mut self, id: DriverId) {
        let Some(driver) = self.drivers.get(&id) else {
            return;
        };
        driver.context.clear_debounce();
        self.redraw(id);
    }

    fn drain_component_actions(&mut self, id: DriverId) {
        let Some(driver) = self.drivers.get_mut(&id) else {
            return;
        };
        let ctx = driver.context.clone();
        let Some(display) = driver.display.as_mut() else {
            return;
        };
        let taken = invoke(|| Ok(display.take_component_actions()));
        let Some(actions) = self.absorb(id, LifecycleState::Active, "take_component_actions", taken)
        else {
            return;
        };

        let mut staged = false;
        for action in actions {
            match action {
                ComponentAction::Launch(launch) => {
                    if let Err(err) = ctx.request_launch(launch) {
                        self.log(
                            LogLevel::Error,
                            TARGET,
                            "component_launch_rejected",
                            [json_kv("driver", id.get()), json_str("error", err.to_string())],
                        );
                    }
                    staged = true;
                }
                ComponentAction::Conclude(conclusion) => {
                    ctx.request_conclusion(conclusion);
                    staged = true;
                }
                ComponentAction::Redraw => ctx.request_redraw(),
            }
        }
        if staged {
            self.schedule_check(id);
        }
    }

    /// Deliver a raw event to the active driver.
    pub(super) fn deliver(&mut self, event: ActivityEvent) {
        let Some(id) = self.active else {
            return;
        };
        let now = Instant::now();
        let Some(driver) = self.drivers.get_mut(&id) else {
            return;
        };
        if driver.state != LifecycleState::Active {
            return;
        }
        let events = driver.input.filter(event, now);
        self.record(|metrics| metrics.record_event());

        for logical in events {
            self.route(id, &logical);
        }
        self.drain_component_actions(id);
        self.after_work(id);
    }

    /// Listener, then display, then the framework default handler.
    fn route(&mut self, id: DriverId, event: &ActivityEvent) {
        let Some(driver) = self.drivers.get_mut(&id) else {
            return;
        };
        let ctx = driver.context.clone();
        let heard = invoke(|| driver.activity.on_event(&ctx, event));
        let mut flow = self
            .absorb(id, LifecycleState::Active, "on_event", heard)
            .unwrap_or(EventFlow::Continue);

        if flow == EventFlow::Continue {
            if let Some(display) = self
                .drivers
                .get_mut(&id)
                .and_then(|driver| driver.display.as_mut())
            {
                let handled = invoke(|| Ok(display.handle_event(event)));
                flow = self
                    .absorb(id, LifecycleState::Active, "handle_event", handled)
                    .unwrap_or(EventFlow::Continue);
            }
        }

        if flow == EventFlow::Continue {
            self.default_handler(id, &ctx, event);
        }
    }

    fn default_handler(&mut self, id: DriverId, ctx: &ActivityContext, event: &ActivityEvent) {
        let ActivityEvent::Key(key) = event else {
            return;
        };
        if key.code == KeyCode::Esc
            && key.kind == KeyEventKind::Press
            && self.tree.previous(id).is_some()
        {
            ctx.request_conclusion(Conclusion::NoData);
            self.log(
                LogLevel::Debug,
                TARGET,
                "default_back_navigation",
                [json_kv("driver", id.get())],
            );
        }
    }
}
