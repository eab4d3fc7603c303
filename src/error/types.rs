use std::time::Duration;

use thiserror::Error;

use crate::activity::{DriverId, LifecycleState};
use crate::logging::LoggingError;

/// Unified result type for the activity runtime.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Result type returned by activity and display callbacks.
pub type ActivityResult<T> = std::result::Result<T, ActivityError>;

/// Errors surfaced by the runtime to its callers.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("application `{0}` is not registered")]
    UnknownApplication(String),
    #[error("activity `{activity}` is not registered for application `{application}`")]
    UnknownActivity {
        application: String,
        activity: String,
    },
    #[error("launch of `{0}` names no application and has no requester to inherit one from")]
    MissingApplication(String),
    #[error("driver {0} no longer exists")]
    UnknownDriver(DriverId),
    #[error("driver {0} still has successors")]
    DriverHasSuccessors(DriverId),
    #[error("a launch is already pending for driver {0}")]
    LaunchAlreadyPending(DriverId),
    #[error("the sole root activity cannot be concluded")]
    RootConclusion,
    #[error("no activity is active")]
    NoActiveActivity,
    #[error("driver {driver} cannot step from {from} to {to}")]
    IllegalTransition {
        driver: DriverId,
        from: LifecycleState,
        to: LifecycleState,
    },
    #[error("launch requester {0:?} could not be located")]
    UnresolvableRequester(Vec<DriverId>),
    #[error("runtime is halting")]
    Halting,
    #[error("runtime worker has stopped")]
    WorkerStopped,
    #[error("halt did not complete within {0:?}")]
    HaltTimeout(Duration),
    #[error("synchronous call issued from the runtime worker")]
    ReentrantCall,
    #[error("unit of work panicked: {0}")]
    WorkPanicked(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("terminal error: {0}")]
    Terminal(String),
    #[error(transparent)]
    Activity(#[from] ActivityError),
    #[error(transparent)]
    Logging(#[from] LoggingError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure raised by application code from a lifecycle callback, event handler,
/// display, or unit of work. The runtime treats these as non-fatal.
#[derive(Debug, Error)]
pub enum ActivityError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl ActivityError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}
