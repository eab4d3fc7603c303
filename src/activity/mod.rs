//! Activity contract and the identity/state types shared by the runtime.
//!
//! Applications implement [`Activity`] for every screen they ship. The runtime
//! owns each instance behind a driver and invokes the callbacks strictly in the
//! order dictated by [`LifecycleState`]; callbacks never race with each other or
//! with rendering because they all run on the runtime worker.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::display::Display;
use crate::error::ActivityResult;
use crate::launch::{LaunchPayload, LaunchSpec};
use crate::runtime::{ActivityContext, ActivityEvent, EventFlow};

pub mod registry;

pub use registry::{
    ActivityDefinition, ActivityFactory, ActivityMetadata, ActivityRegistry, ApplicationDefinition,
};

/// Opaque blob written by [`Activity::close`] and handed back to the next
/// [`Activity::open`].
pub type SavedState = LaunchPayload;

/// Monotonically increasing identity of a driver instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DriverId(u64);

impl DriverId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle states of a driver, in their strict total order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Constructed,
    Initialized,
    Open,
    Active,
}

impl LifecycleState {
    /// The adjacent state above this one.
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Constructed => Some(Self::Initialized),
            Self::Initialized => Some(Self::Open),
            Self::Open => Some(Self::Active),
            Self::Active => None,
        }
    }

    /// The adjacent state below this one.
    pub const fn prev(self) -> Option<Self> {
        match self {
            Self::Constructed => None,
            Self::Initialized => Some(Self::Constructed),
            Self::Open => Some(Self::Initialized),
            Self::Active => Some(Self::Open),
        }
    }

    /// True when `other` is exactly one step away.
    pub fn is_adjacent(self, other: Self) -> bool {
        self.next() == Some(other) || self.prev() == Some(other)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Constructed => "constructed",
            Self::Initialized => "initialized",
            Self::Open => "open",
            Self::Active => "active",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to a relaunch offer.
#[derive(Debug, Clone, PartialEq)]
pub enum Relaunch {
    /// Reuse this instance; it is reopened with the given state.
    Relaunched(SavedState),
    /// Start a fresh instance instead.
    Refused,
}

/// Data returned by a concluded child to the activity that launched it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityResponse {
    pub from: DriverId,
    pub activity: String,
    pub request_id: Option<String>,
    pub data: LaunchPayload,
}

/// Contract implemented by every screen hosted by the runtime.
///
/// Only [`Activity::open`] is required. Errors and panics raised from any
/// callback are caught by the runtime, logged, and never abort the lifecycle
/// transition in progress.
pub trait Activity: Any + Send {
    fn init(&mut self, _ctx: &ActivityContext) -> ActivityResult<()> {
        Ok(())
    }

    /// Build the display for this open period. Returning `None` makes the
    /// runtime fall back to a [`crate::display::DefaultDisplay`].
    fn open(
        &mut self,
        ctx: &ActivityContext,
        saved: Option<SavedState>,
    ) -> ActivityResult<Option<Box<dyn Display>>>;

    fn activate(&mut self, _ctx: &ActivityContext) -> ActivityResult<()> {
        Ok(())
    }

    fn passivate(&mut self, _ctx: &ActivityContext) -> ActivityResult<()> {
        Ok(())
    }

    /// Write anything needed to resume into `output`; it is handed back to the
    /// next `open`.
    fn close(&mut self, _ctx: &ActivityContext, _output: &mut SavedState) -> ActivityResult<()> {
        Ok(())
    }

    fn destroy(&mut self, _ctx: &ActivityContext) -> ActivityResult<()> {
        Ok(())
    }

    fn relaunch(&mut self, _ctx: &ActivityContext, _launch: &LaunchSpec) -> ActivityResult<Relaunch> {
        Ok(Relaunch::Refused)
    }

    /// Receives data returned by a concluded child. Delivered just before
    /// `activate`.
    fn on_response(
        &mut self,
        _ctx: &ActivityContext,
        _response: ActivityResponse,
    ) -> ActivityResult<()> {
        Ok(())
    }

    /// Application-level listener; runs before the display and the framework
    /// default handler see the event.
    fn on_event(
        &mut self,
        _ctx: &ActivityContext,
        _event: &ActivityEvent,
    ) -> ActivityResult<EventFlow> {
        Ok(EventFlow::Continue)
    }
}
