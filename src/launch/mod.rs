//! Launch descriptors and conclusion values.
//!
//! A [`DeferredActivity`] is built by application code, staged on its
//! [`crate::ActivityContext`], and consumed exactly once by the manager. The
//! inner [`LaunchSpec`] is shared copy-on-write: once the descriptor has been
//! handed over, further edits by the application clone the spec instead of
//! mutating the staged one.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::activity::DriverId;
use crate::error::{Result, RuntimeError};

/// Opaque keyed blob carried by launches, conclusions and saved state.
pub type LaunchPayload = Map<String, Value>;

/// Where a launched activity attaches in the activity forest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Above the driver that requested the launch.
    #[default]
    AboveCurrent,
    /// Above the top of the whole forest.
    AboveTop,
    /// As the root of a brand-new stack.
    Detached,
}

/// Placement plus the replace/respond/relaunch modifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LaunchMode {
    pub placement: Placement,
    #[serde(default)]
    pub replace: bool,
    #[serde(default)]
    pub respond: bool,
    #[serde(default)]
    pub relaunch: bool,
}

impl LaunchMode {
    pub const fn above_current() -> Self {
        Self::with_placement(Placement::AboveCurrent)
    }

    pub const fn above_top() -> Self {
        Self::with_placement(Placement::AboveTop)
    }

    pub const fn detached() -> Self {
        Self::with_placement(Placement::Detached)
    }

    const fn with_placement(placement: Placement) -> Self {
        Self {
            placement,
            replace: false,
            respond: false,
            relaunch: false,
        }
    }

    /// The resolved parent is replaced instead of extended.
    pub const fn replacing(mut self) -> Self {
        self.replace = true;
        self
    }

    /// Data returned on conclusion is queued for the parent.
    pub const fn responding(mut self) -> Self {
        self.respond = true;
        self
    }

    /// Prefer reusing a running ancestor of the same activity.
    pub const fn relaunching(mut self) -> Self {
        self.relaunch = true;
        self
    }
}

/// Wire shape of a launch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub activity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
    /// Specific running instance to relaunch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<DriverId>,
    /// Requester chain at request time, root first.
    #[serde(default)]
    pub ancestors: Vec<DriverId>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub payload: LaunchPayload,
    #[serde(default)]
    pub mode: LaunchMode,
}

impl LaunchSpec {
    pub fn new(activity: impl Into<String>) -> Self {
        Self {
            activity: activity.into(),
            application: None,
            instance: None,
            ancestors: Vec::new(),
            request_id: None,
            payload: LaunchPayload::new(),
            mode: LaunchMode::default(),
        }
    }
}

/// Copy-on-write handle around a [`LaunchSpec`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredActivity {
    spec: Arc<LaunchSpec>,
}

impl DeferredActivity {
    pub fn new(activity: impl Into<String>) -> Self {
        Self::from_spec(LaunchSpec::new(activity))
    }

    pub fn from_spec(spec: LaunchSpec) -> Self {
        Self {
            spec: Arc::new(spec),
        }
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    /// True once another handle shares the spec, meaning the next edit copies.
    pub fn is_exposed(&self) -> bool {
        Arc::strong_count(&self.spec) > 1
    }

    fn edit(&mut self) -> &mut LaunchSpec {
        Arc::make_mut(&mut self.spec)
    }

    pub fn in_application(mut self, application: impl Into<String>) -> Self {
        self.edit().application = Some(application.into());
        self
    }

    pub fn targeting_instance(mut self, instance: DriverId) -> Self {
        self.edit().instance = Some(instance);
        self
    }

    pub fn with_mode(mut self, mode: LaunchMode) -> Self {
        self.set_mode(mode);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.set_request_id(Some(request_id.into()));
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert_payload(key, value);
        self
    }

    pub fn set_mode(&mut self, mode: LaunchMode) {
        self.edit().mode = mode;
    }

    pub fn set_request_id(&mut self, request_id: Option<String>) {
        self.edit().request_id = request_id;
    }

    pub fn insert_payload(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.edit().payload.insert(key.into(), value.into());
    }

    pub(crate) fn set_ancestors(&mut self, chain: Vec<DriverId>) {
        self.edit().ancestors = chain;
    }

    pub(crate) fn clear_relaunch(&mut self) {
        self.edit().mode.relaunch = false;
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self.spec()).map_err(|err| RuntimeError::Decode(err.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str::<LaunchSpec>(raw)
            .map(Self::from_spec)
            .map_err(|err| RuntimeError::Decode(err.to_string()))
    }
}

/// Value an activity concludes with.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Conclusion {
    /// Canonical "no data" value; never produces a response.
    #[default]
    NoData,
    Data(LaunchPayload),
}

impl Conclusion {
    pub fn with_data(data: LaunchPayload) -> Self {
        Self::Data(data)
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data(_))
    }

    pub fn into_data(self) -> Option<LaunchPayload> {
        match self {
            Self::Data(data) => Some(data),
            Self::NoData => None,
        }
    }
}
