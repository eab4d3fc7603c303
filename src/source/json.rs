use std::io::BufRead;
use std::time::Duration;

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyEventState, KeyModifiers};
use serde_json::Value;

use crate::error::{Result, RuntimeError};
use crate::runtime::ActivityEvent;
use crate::Size;

use super::EventSource;

/// One JSON object per line, tagged by `type`.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "lowercase")]
pub enum JsonInbound {
    Key {
        code: String,
        #[serde(default)]
        modifiers: Vec<String>,
    },
    Resize {
        width: u16,
        height: u16,
    },
    Tick {
        ms: u64,
    },
    Paste {
        data: String,
    },
    Focus {
        gained: bool,
    },
    Custom {
        name: String,
        #[serde(default)]
        payload: Value,
    },
}

impl JsonInbound {
    pub fn into_event(self) -> Result<ActivityEvent> {
        Ok(match self {
            JsonInbound::Key { code, modifiers } => {
                ActivityEvent::Key(build_key_event(&code, &modifiers)?)
            }
            JsonInbound::Resize { width, height } => ActivityEvent::Resize(Size::new(width, height)),
            JsonInbound::Tick { ms } => ActivityEvent::Tick {
                elapsed: Duration::from_millis(ms),
            },
            JsonInbound::Paste { data } => ActivityEvent::Paste(data),
            JsonInbound::Focus { gained: true } => ActivityEvent::FocusGained,
            JsonInbound::Focus { gained: false } => ActivityEvent::FocusLost,
            JsonInbound::Custom { name, payload } => ActivityEvent::Custom { name, payload },
        })
    }
}

/// Reads scripted events from any buffered reader, one line per poll.
pub struct JsonLineSource<R> {
    reader: R,
    line: String,
    exhausted: bool,
}

impl<R: BufRead + Send> JsonLineSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            exhausted: false,
        }
    }
}

impl<R: BufRead + Send> EventSource for JsonLineSource<R> {
    fn name(&self) -> &str {
        "json"
    }

    fn poll(&mut self, _timeout: Duration) -> Result<Vec<ActivityEvent>> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                self.exhausted = true;
                return Ok(Vec::new());
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let inbound: JsonInbound = serde_json::from_str(trimmed)
                .map_err(|err| RuntimeError::Decode(err.to_string()))?;
            return Ok(vec![inbound.into_event()?]);
        }
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

fn build_key_event(code: &str, modifiers: &[String]) -> Result<KeyEvent> {
    Ok(KeyEvent {
        code: parse_key_code(code)?,
        modifiers: parse_modifiers(modifiers),
        kind: KeyEventKind::Press,
        state: KeyEventState::NONE,
    })
}

fn parse_modifiers(modifiers: &[String]) -> KeyModifiers {
    let mut result = KeyModifiers::empty();
    for m in modifiers {
        match m.to_ascii_lowercase().as_str() {
            "control" | "ctrl" => result |= KeyModifiers::CONTROL,
            "alt" => result |= KeyModifiers::ALT,
            "shift" => result |= KeyModifiers::SHIFT,
            _ => {}
        }
    }
    result
}

fn parse_key_code(code: &str) -> Result<KeyCode> {
    let mut chars = code.chars();
    if let (Some(ch), None) = (chars.next(), chars.next()) {
        return Ok(KeyCode::Char(ch));
    }
    let lower = code.to_ascii_lowercase();
    let key = match lower.as_str() {
        "enter" => KeyCode::Enter,
        "backspace" => KeyCode::Backspace,
        "esc" | "escape" => KeyCode::Esc,
        "tab" => KeyCode::Tab,
        "space" => KeyCode::Char(' '),
        "up" => KeyCode::Up,
        "down" => KeyCode::Down,
        "left" => KeyCode::Left,
        "right" => KeyCode::Right,
        "home" => KeyCode::Home,
        "end" => KeyCode::End,
        "pageup" => KeyCode::PageUp,
        "pagedown" => KeyCode::PageDown,
        "delete" | "del" => KeyCode::Delete,
        "insert" => KeyCode::Insert,
        other => match other.strip_prefix('f').and_then(|n| n.parse::<u8>().ok()) {
            Some(n) if (1..=24).contains(&n) => KeyCode::F(n),
            _ => return Err(RuntimeError::Decode(format!("unknown key code `{code}`"))),
        },
    };
    Ok(key)
}
