use std::io::{self, Stdout};
use std::time::Duration;

use crossterm::cursor::{Hide, Show};
use crossterm::event::{self, Event as CrosstermEvent};
use crossterm::execute;
use crossterm::terminal::{self, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen};

use crate::error::{Result, RuntimeError};
use crate::runtime::ActivityEvent;
use crate::Size;

use super::EventSource;

/// Reads keyboard, mouse and resize events from the controlling terminal.
#[derive(Debug, Default)]
pub struct TerminalSource;

impl TerminalSource {
    pub fn new() -> Self {
        Self
    }
}

impl EventSource for TerminalSource {
    fn name(&self) -> &str {
        "terminal"
    }

    fn poll(&mut self, timeout: Duration) -> Result<Vec<ActivityEvent>> {
        if !event::poll(timeout)? {
            return Ok(Vec::new());
        }
        let mut events = vec![map_event(event::read()?)];
        // Drain whatever else is already buffered without waiting.
        while event::poll(Duration::ZERO)? {
            events.push(map_event(event::read()?));
        }
        Ok(events)
    }
}

pub fn map_event(event: CrosstermEvent) -> ActivityEvent {
    match event {
        CrosstermEvent::Key(key) => ActivityEvent::Key(key),
        CrosstermEvent::Mouse(mouse) => ActivityEvent::Mouse(mouse),
        CrosstermEvent::Paste(data) => ActivityEvent::Paste(data),
        CrosstermEvent::FocusGained => ActivityEvent::FocusGained,
        CrosstermEvent::FocusLost => ActivityEvent::FocusLost,
        CrosstermEvent::Resize(width, height) => ActivityEvent::Resize(Size::new(width, height)),
    }
}

/// Raw mode plus alternate screen for as long as the session lives.
pub struct TerminalSession {
    stdout: Stdout,
    active: bool,
}

impl TerminalSession {
    pub fn enter() -> Result<Self> {
        let mut stdout = io::stdout();
        terminal::enable_raw_mode().map_err(|err| RuntimeError::Terminal(err.to_string()))?;
        execute!(stdout, EnterAlternateScreen, Hide, Clear(ClearType::All))?;
        Ok(Self {
            stdout,
            active: true,
        })
    }

    pub fn size(&self) -> Result<Size> {
        let (width, height) = terminal::size()?;
        Ok(Size::new(width, height))
    }

    pub fn leave(mut self) {
        self.restore();
    }

    fn restore(&mut self) {
        if !self.active {
            return;
        }
        execute!(self.stdout, Show, LeaveAlternateScreen).ok();
        terminal::disable_raw_mode().ok();
        self.active = false;
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        self.restore();
    }
}
