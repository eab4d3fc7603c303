//! Instrumented activities and displays shared by the unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::activity::{Activity, ActivityDefinition, ActivityResponse, Relaunch, SavedState};
use crate::display::{ComponentAction, Display, Frame, RedrawDelay};
use crate::error::{ActivityError, ActivityResult};
use crate::launch::LaunchSpec;
use crate::runtime::{ActivityContext, ActivityEvent, EventFlow};

/// Shared journal of callbacks, renders and responses across instances.
#[derive(Clone, Default)]
pub(crate) struct Probe {
    calls: Arc<Mutex<Vec<String>>>,
    renders: Arc<Mutex<HashMap<String, usize>>>,
    responses: Arc<Mutex<HashMap<String, Vec<ActivityResponse>>>>,
    opened: Arc<Mutex<HashMap<String, Vec<Option<SavedState>>>>>,
}

impl Probe {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn push(&self, name: &str, callback: &str) {
        self.calls.lock().push(format!("{name}:{callback}"));
    }

    /// Callbacks recorded for `name`, without the name prefix.
    pub(crate) fn calls_of(&self, name: &str) -> Vec<String> {
        let prefix = format!("{name}:");
        self.calls
            .lock()
            .iter()
            .filter_map(|entry| entry.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub(crate) fn count(&self, entry: &str) -> usize {
        self.calls.lock().iter().filter(|e| *e == entry).count()
    }

    pub(crate) fn renders(&self, name: &str) -> usize {
        self.renders.lock().get(name).copied().unwrap_or_default()
    }

    pub(crate) fn responses_of(&self, name: &str) -> Vec<ActivityResponse> {
        self.responses.lock().get(name).cloned().unwrap_or_default()
    }

    pub(crate) fn opened_with(&self, name: &str) -> Vec<Option<SavedState>> {
        self.opened.lock().get(name).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum Fault {
    #[default]
    None,
    Error,
    Panic,
}

type Hook = Box<dyn FnMut(&ActivityContext) + Send>;

pub(crate) struct RecordingActivity {
    name: String,
    probe: Probe,
    fault: Fault,
    relaunch_state: Option<SavedState>,
    redraw_delay: RedrawDelay,
    actions: Vec<ComponentAction>,
    on_activate: Option<Hook>,
    pub(crate) counter: u32,
}

impl RecordingActivity {
    pub(crate) fn new(name: impl Into<String>, probe: &Probe) -> Self {
        Self {
            name: name.into(),
            probe: probe.clone(),
            fault: Fault::None,
            relaunch_state: None,
            redraw_delay: RedrawDelay::Idle,
            actions: Vec::new(),
            on_activate: None,
            counter: 0,
        }
    }

    /// Instance whose journal nobody reads.
    pub(crate) fn detached() -> Self {
        Self::new("detached", &Probe::new())
    }

    pub(crate) fn failing(mut self, fault: Fault) -> Self {
        self.fault = fault;
        self
    }

    pub(crate) fn accepting_relaunch(mut self, state: SavedState) -> Self {
        self.relaunch_state = Some(state);
        self
    }

    pub(crate) fn redrawing(mut self, delay: RedrawDelay) -> Self {
        self.redraw_delay = delay;
        self
    }

    /// Component actions raised by the first display after its first render.
    pub(crate) fn emitting(mut self, action: ComponentAction) -> Self {
        self.actions.push(action);
        self
    }

    pub(crate) fn on_activate(mut self, hook: impl FnMut(&ActivityContext) + Send + 'static) -> Self {
        self.on_activate = Some(Box::new(hook));
        self
    }

    fn record(&self, callback: &str) -> ActivityResult<()> {
        self.probe.push(&self.name, callback);
        match self.fault {
            Fault::None => Ok(()),
            Fault::Error => Err(ActivityError::msg(format!("{} {callback} failed", self.name))),
            Fault::Panic => panic!("{} {callback} exploded", self.name),
        }
    }
}

impl Activity for RecordingActivity {
    fn init(&mut self, _ctx: &ActivityContext) -> ActivityResult<()> {
        self.record("init")
    }

    fn open(
        &mut self,
        _ctx: &ActivityContext,
        saved: Option<SavedState>,
    ) -> ActivityResult<Option<Box<dyn Display>>> {
        self.probe
            .opened
            .lock()
            .entry(self.name.clone())
            .or_default()
            .push(saved);
        self.record("open")?;
        Ok(Some(Box::new(ProbeDisplay {
            name: self.name.clone(),
            probe: self.probe.clone(),
            delay: self.redraw_delay,
            actions: std::mem::take(&mut self.actions),
            rendered: false,
        })))
    }

    fn activate(&mut self, ctx: &ActivityContext) -> ActivityResult<()> {
        self.record("activate")?;
        if let Some(hook) = self.on_activate.as_mut() {
            hook(ctx);
        }
        Ok(())
    }

    fn passivate(&mut self, _ctx: &ActivityContext) -> ActivityResult<()> {
        self.record("passivate")
    }

    fn close(&mut self, _ctx: &ActivityContext, _output: &mut SavedState) -> ActivityResult<()> {
        self.record("close")
    }

    fn destroy(&mut self, _ctx: &ActivityContext) -> ActivityResult<()> {
        self.record("destroy")
    }

    fn relaunch(&mut self, _ctx: &ActivityContext, _launch: &LaunchSpec) -> ActivityResult<Relaunch> {
        self.record("relaunch")?;
        Ok(match &self.relaunch_state {
            Some(state) => Relaunch::Relaunched(state.clone()),
            None => Relaunch::Refused,
        })
    }

    fn on_response(
        &mut self,
        _ctx: &ActivityContext,
        response: ActivityResponse,
    ) -> ActivityResult<()> {
        self.probe
            .responses
            .lock()
            .entry(self.name.clone())
            .or_default()
            .push(response);
        self.record("response")
    }

    fn on_event(
        &mut self,
        _ctx: &ActivityContext,
        _event: &ActivityEvent,
    ) -> ActivityResult<EventFlow> {
        self.record("event")?;
        Ok(EventFlow::Continue)
    }
}

struct ProbeDisplay {
    name: String,
    probe: Probe,
    delay: RedrawDelay,
    actions: Vec<ComponentAction>,
    rendered: bool,
}

impl Display for ProbeDisplay {
    fn render(&mut self, frame: &mut Frame) -> ActivityResult<()> {
        frame.set_line(0, &self.name);
        *self.probe.renders.lock().entry(self.name.clone()).or_default() += 1;
        self.rendered = true;
        Ok(())
    }

    fn next_redraw_delay(&self, _now: Instant) -> RedrawDelay {
        self.delay
    }

    fn take_component_actions(&mut self) -> Vec<ComponentAction> {
        if self.rendered {
            std::mem::take(&mut self.actions)
        } else {
            Vec::new()
        }
    }
}

/// Definition whose instances record into `probe` under `id`.
pub(crate) fn recording(id: &'static str, probe: &Probe) -> ActivityDefinition {
    custom(id, probe, |activity| activity)
}

/// Like [`recording`], with each fresh instance passed through `configure`.
pub(crate) fn custom<F>(id: &'static str, probe: &Probe, configure: F) -> ActivityDefinition
where
    F: Fn(RecordingActivity) -> RecordingActivity + Send + Sync + 'static,
{
    let probe = probe.clone();
    ActivityDefinition::from_fn(id, id.to_uppercase(), move || {
        configure(RecordingActivity::new(id, &probe))
    })
}
