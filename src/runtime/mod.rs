//! Activity runtime: drivers, contexts, the activity tree and the manager that
//! serializes every mutation onto a single worker thread.

use std::sync::Arc;
use std::time::Duration;

use crossterm::event::{KeyEvent, MouseEvent};
use parking_lot::Mutex;
use serde_json::Value;

use crate::logging::Logger;
use crate::metrics::RuntimeMetrics;
use crate::Size;

pub mod audit;
mod context;
mod driver;
pub mod input;
mod manager;
pub mod tree;
mod worker;

pub use audit::{
    LifecycleAudit, LifecycleAuditEvent, LifecycleAuditEventBuilder, LifecycleAuditStage,
    MemoryAudit, NullLifecycleAudit,
};
pub use context::{ActivityContext, Completion, WorkScope};
pub use input::{InputFilter, InputFilterConfig};
pub use manager::{ActivityManager, DriverSnapshot, EventSink, TreeSnapshot};
pub use tree::ActivityTree;

/// Events delivered to the active activity.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityEvent {
    Tick { elapsed: Duration },
    Key(KeyEvent),
    Mouse(MouseEvent),
    Paste(String),
    FocusGained,
    FocusLost,
    Resize(Size),
    /// Device-specific event with an opaque payload.
    Custom { name: String, payload: Value },
}

impl ActivityEvent {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Tick { .. } => "tick",
            Self::Key(_) => "key",
            Self::Mouse(_) => "mouse",
            Self::Paste(_) => "paste",
            Self::FocusGained => "focus_gained",
            Self::FocusLost => "focus_lost",
            Self::Resize(_) => "resize",
            Self::Custom { .. } => "custom",
        }
    }
}

/// Control the propagation of an event from listener to display to default handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFlow {
    Continue,
    Consumed,
}

/// Configuration knobs for the activity manager.
#[derive(Clone)]
pub struct ManagerConfig {
    /// Delay applied to redraw requests issued off the worker.
    pub redraw_debounce: Duration,
    /// Interval between polls of attached event sources.
    pub poll_interval: Duration,
    /// Grace period used when a manager is dropped without an explicit halt.
    pub halt_timeout: Duration,
    /// Key-repeat folding applied before events reach an activity.
    pub input: InputFilterConfig,
    /// Optional structured logger used by the runtime.
    pub logger: Option<Logger>,
    /// Lifecycle audit sink.
    pub audit: Arc<dyn LifecycleAudit>,
    /// Metrics accumulator used for periodic snapshots.
    pub metrics: Option<Arc<Mutex<RuntimeMetrics>>>,
    /// Interval between metrics snapshot emissions. Zero disables snapshots.
    pub metrics_interval: Duration,
    /// Target field used when emitting metrics snapshots.
    pub metrics_target: String,
    /// Name given to the worker thread.
    pub worker_name: String,
    /// Frame size used when no surface is supplied.
    pub screen_size: Size,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            redraw_debounce: Duration::from_millis(16),
            poll_interval: Duration::from_millis(50),
            halt_timeout: Duration::from_secs(2),
            input: InputFilterConfig::default(),
            logger: None,
            audit: Arc::new(NullLifecycleAudit),
            metrics: None,
            metrics_interval: Duration::from_secs(5),
            metrics_target: "room::activity.metrics".to_string(),
            worker_name: "room-activity-worker".to_string(),
            screen_size: Size::new(80, 24),
        }
    }
}

impl ManagerConfig {
    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn LifecycleAudit>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_redraw_debounce(mut self, debounce: Duration) -> Self {
        self.redraw_debounce = debounce;
        self
    }

    /// Enable metrics collection if it has not already been configured.
    pub fn enable_metrics(&mut self) {
        if self.metrics.is_none() {
            self.metrics = Some(Arc::new(Mutex::new(RuntimeMetrics::new())));
        }
    }

    /// Disable metrics collection and prevent further snapshots.
    pub fn disable_metrics(&mut self) {
        self.metrics = None;
    }

    /// Access the shared metrics handle if metrics are enabled.
    pub fn metrics_handle(&self) -> Option<Arc<Mutex<RuntimeMetrics>>> {
        self.metrics.as_ref().map(Arc::clone)
    }
}
