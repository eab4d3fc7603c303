//! Lifecycle audit utilities.
//!
//! Lightweight instrumentation hooks so callers can observe every driver
//! transition and protocol decision taken by the manager. Records capture a
//! stage identifier plus structured metadata so downstream code can log,
//! buffer, or assert on the runtime's progression without touching the worker.

use std::time::SystemTime;

use parking_lot::Mutex;
use serde_json::Value;

use crate::activity::{DriverId, LifecycleState};

/// Distinct checkpoints emitted by the activity manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAuditStage {
    /// A driver was allocated for an accepted launch.
    DriverCreated,
    /// A driver moved one step through its state machine.
    StateChanged,
    /// A launch request was turned into a tree mutation.
    LaunchResolved,
    /// A launch request was dropped (halting or unresolvable requester).
    LaunchRefused,
    /// A driver was concluded and removed from the tree.
    ConclusionResolved,
    /// A conclusion was refused (sole root).
    ConclusionRefused,
    /// An activity accepted a relaunch offer.
    RelaunchAccepted,
    /// An activity refused a relaunch offer; a fresh instance follows.
    RelaunchRefused,
    /// A frame was rendered and presented.
    RedrawCommitted,
    /// An activity or display callback failed or panicked.
    ActivityFault,
    /// Halt was requested.
    HaltStarted,
    /// Every driver was concluded and the worker is stopping.
    HaltCompleted,
}

/// Structured audit entry.
#[derive(Debug, Clone)]
pub struct LifecycleAuditEvent {
    pub timestamp: SystemTime,
    pub stage: LifecycleAuditStage,
    pub driver: Option<DriverId>,
    pub transition: Option<(LifecycleState, LifecycleState)>,
    pub details: Vec<(String, Value)>,
}

impl LifecycleAuditEvent {
    fn new(stage: LifecycleAuditStage) -> Self {
        Self {
            timestamp: SystemTime::now(),
            stage,
            driver: None,
            transition: None,
            details: Vec::new(),
        }
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }
}

/// Builder helper to append fields ergonomically.
pub struct LifecycleAuditEventBuilder {
    event: LifecycleAuditEvent,
}

impl LifecycleAuditEventBuilder {
    pub fn new(stage: LifecycleAuditStage) -> Self {
        Self {
            event: LifecycleAuditEvent::new(stage),
        }
    }

    pub fn driver(&mut self, driver: DriverId) -> &mut Self {
        self.event.driver = Some(driver);
        self
    }

    pub fn transition(&mut self, from: LifecycleState, to: LifecycleState) -> &mut Self {
        self.event.transition = Some((from, to));
        self
    }

    pub fn detail(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.event.details.push((key.into(), value));
        self
    }

    pub fn finish(self) -> LifecycleAuditEvent {
        self.event
    }
}

/// Trait implemented by any audit sink. Called on the worker thread.
pub trait LifecycleAudit: Send + Sync {
    fn record(&self, event: LifecycleAuditEvent);
}

/// Default no-op implementation used when auditing is disabled.
#[derive(Debug, Default)]
pub struct NullLifecycleAudit;

impl LifecycleAudit for NullLifecycleAudit {
    fn record(&self, _event: LifecycleAuditEvent) {}
}

/// Buffers every audit record in memory.
#[derive(Debug, Default)]
pub struct MemoryAudit {
    events: Mutex<Vec<LifecycleAuditEvent>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleAuditEvent> {
        self.events.lock().clone()
    }

    pub fn stages(&self) -> Vec<LifecycleAuditStage> {
        self.events.lock().iter().map(|event| event.stage).collect()
    }

    /// Every state change observed for `driver`, in order.
    pub fn transitions_for(&self, driver: DriverId) -> Vec<(LifecycleState, LifecycleState)> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.driver == Some(driver))
            .filter_map(|event| event.transition)
            .collect()
    }

    pub fn count(&self, stage: LifecycleAuditStage) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.stage == stage)
            .count()
    }
}

impl LifecycleAudit for MemoryAudit {
    fn record(&self, event: LifecycleAuditEvent) {
        self.events.lock().push(event);
    }
}
