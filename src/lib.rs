//! Embedded activity lifecycle runtime.
//!
//! Applications register [`Activity`] factories in an [`ActivityRegistry`]; the
//! [`ActivityManager`] instantiates them behind drivers, walks each through the
//! CONSTRUCTED → INITIALIZED → OPEN → ACTIVE lifecycle, keeps exactly one of
//! them active, and serializes every lifecycle transition, event and unit of
//! work onto a single worker thread.

pub mod activity;
pub mod display;
pub mod error;
pub mod geometry;
pub mod launch;
pub mod logging;
pub mod metrics;
pub mod runtime;
pub mod source;
pub mod width;

#[cfg(test)]
mod testing;

pub use activity::{
    Activity, ActivityDefinition, ActivityFactory, ActivityMetadata, ActivityRegistry,
    ActivityResponse, ApplicationDefinition, DriverId, LifecycleState, Relaunch, SavedState,
};
pub use display::{
    AnsiSurface, ComponentAction, DefaultDisplay, Display, Frame, NullSurface, RedrawDelay,
    Surface,
};
pub use error::{ActivityError, ActivityResult, Result, RuntimeError};
pub use geometry::{Rect, Size};
pub use launch::{Conclusion, DeferredActivity, LaunchMode, LaunchPayload, LaunchSpec, Placement};
pub use logging::{
    FileSink, LogEvent, LogFields, LogLevel, LogSink, Logger, LoggingError, LoggingResult,
    MemorySink,
};
pub use metrics::{MetricSnapshot, RuntimeMetrics};
pub use runtime::{
    ActivityContext, ActivityEvent, ActivityManager, ActivityTree, Completion, DriverSnapshot,
    EventFlow, EventSink, InputFilter, InputFilterConfig, LifecycleAudit, LifecycleAuditEvent,
    LifecycleAuditEventBuilder, LifecycleAuditStage, ManagerConfig, MemoryAudit,
    NullLifecycleAudit, TreeSnapshot, WorkScope,
};
pub use source::{
    EventPoller, EventSource, JsonInbound, JsonLineSource, TerminalSession, TerminalSource,
    map_event,
};
pub use width::display_width;
