//! Stateful key filter applied before events reach an activity.
//!
//! Devices with auto-repeat flood the queue with identical key events while a
//! key is held. The filter folds those into logical events: the first press is
//! always delivered, repeats are rate-limited per key, and releases are dropped
//! unless explicitly requested.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind};

use super::ActivityEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputFilterConfig {
    /// Minimum spacing between delivered repeats of the same held key.
    pub repeat_interval: Duration,
    /// Deliver `KeyEventKind::Release` events.
    pub deliver_releases: bool,
}

impl Default for InputFilterConfig {
    fn default() -> Self {
        Self {
            repeat_interval: Duration::from_millis(50),
            deliver_releases: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InputFilter {
    config: InputFilterConfig,
    held: HashMap<KeyCode, Instant>,
}

impl InputFilter {
    pub fn new(config: InputFilterConfig) -> Self {
        Self {
            config,
            held: HashMap::new(),
        }
    }

    /// Forget every held key. Called when the owning driver activates.
    pub fn reset(&mut self) {
        self.held.clear();
    }

    /// Fold one raw event into zero or more logical events.
    pub fn filter(&mut self, event: ActivityEvent, now: Instant) -> Vec<ActivityEvent> {
        let ActivityEvent::Key(key) = event else {
            return vec![event];
        };

        match key.kind {
            KeyEventKind::Press => {
                self.held.insert(key.code, now);
                vec![ActivityEvent::Key(key)]
            }
            KeyEventKind::Repeat => match self.held.get(&key.code).copied() {
                None => {
                    // Press was lost (e.g. delivered to a previous activity).
                    self.held.insert(key.code, now);
                    vec![ActivityEvent::Key(KeyEvent {
                        kind: KeyEventKind::Press,
                        ..key
                    })]
                }
                Some(last) if now.duration_since(last) < self.config.repeat_interval => {
                    Vec::new()
                }
                Some(_) => {
                    self.held.insert(key.code, now);
                    vec![ActivityEvent::Key(key)]
                }
            },
            KeyEventKind::Release => {
                self.held.remove(&key.code);
                if self.config.deliver_releases {
                    vec![ActivityEvent::Key(key)]
                } else {
                    Vec::new()
                }
            }
        }
    }
}

impl Default for InputFilter {
    fn default() -> Self {
        Self::new(InputFilterConfig::default())
    }
}
