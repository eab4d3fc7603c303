//! Display collaborator consumed by drivers.
//!
//! A driver owns exactly one [`Display`] for each OPEN/ACTIVE period of its
//! activity. The runtime only asks it to render into a [`Frame`], to report
//! when it next needs a redraw, and to react to input; how it draws is up to
//! the application.

use std::time::{Duration, Instant};

use crate::error::ActivityResult;
use crate::launch::{Conclusion, DeferredActivity};
use crate::runtime::{ActivityEvent, EventFlow};

mod frame;
mod surface;

pub use frame::Frame;
pub use surface::{AnsiSurface, NullSurface, Surface};

/// When a display wants to be rendered again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedrawDelay {
    /// Render again as soon as the worker is free.
    Immediate,
    /// Render once the delay elapses.
    After(Duration),
    /// Nothing is animating.
    Idle,
}

/// Requests raised by components inside a display, drained by the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentAction {
    Launch(DeferredActivity),
    Conclude(Conclusion),
    Redraw,
}

pub trait Display: Send {
    fn render(&mut self, frame: &mut Frame) -> ActivityResult<()>;

    fn next_redraw_delay(&self, _now: Instant) -> RedrawDelay {
        RedrawDelay::Idle
    }

    fn capture_resources(&mut self) {}

    fn release_resources(&mut self) {}

    fn take_component_actions(&mut self) -> Vec<ComponentAction> {
        Vec::new()
    }

    fn handle_event(&mut self, _event: &ActivityEvent) -> EventFlow {
        EventFlow::Continue
    }

    fn destroy(&mut self) {}
}

/// Fallback display synthesized when an activity opens without one.
#[derive(Debug, Clone)]
pub struct DefaultDisplay {
    title: String,
}

impl DefaultDisplay {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }
}

impl Display for DefaultDisplay {
    fn render(&mut self, frame: &mut Frame) -> ActivityResult<()> {
        frame.clear();
        frame.set_line(0, &self.title);
        Ok(())
    }
}
