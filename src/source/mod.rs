//! Event sources feeding the manager from outside the worker.
//!
//! A source is polled on its own thread by an [`EventPoller`]; whatever it
//! yields is queued through an [`EventSink`] and reaches the active activity
//! on the worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Result, RuntimeError};
use crate::logging::{LogLevel, Logger, event_with_fields, json_str};
use crate::runtime::{ActivityEvent, ActivityManager, EventSink};

mod json;
mod terminal;

pub use json::{JsonInbound, JsonLineSource};
pub use terminal::{TerminalSession, TerminalSource, map_event};

const TARGET: &str = "room::activity.source";

/// Anything that produces activity events.
pub trait EventSource: Send {
    fn name(&self) -> &str;

    /// Wait up to `timeout` for events. An empty vector means nothing arrived.
    fn poll(&mut self, timeout: Duration) -> Result<Vec<ActivityEvent>>;

    /// `true` once the source will never produce another event.
    fn is_exhausted(&self) -> bool {
        false
    }
}

/// Background thread pumping one source into the manager.
pub struct EventPoller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl EventPoller {
    pub fn spawn<S>(
        source: S,
        sink: EventSink,
        interval: Duration,
        logger: Option<Logger>,
    ) -> Result<Self>
    where
        S: EventSource + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let name = format!("room-source-{}", source.name());
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || pump(source, sink, interval, flag, logger))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }

    /// Ask the thread to stop after its current poll and wait for it.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| RuntimeError::WorkPanicked("event poller".to_string()))?,
            None => Ok(()),
        }
    }
}

impl Drop for EventPoller {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn pump<S: EventSource>(
    mut source: S,
    sink: EventSink,
    interval: Duration,
    stop: Arc<AtomicBool>,
    logger: Option<Logger>,
) -> Result<()> {
    let name = source.name().to_string();
    let log = |level: LogLevel, message: &str, detail: String| {
        if let Some(logger) = logger.as_ref() {
            let fields = [json_str("source", name.as_str()), json_str("detail", detail)];
            let _ = logger.log_event(event_with_fields(level, TARGET, message, fields));
        }
    };

    while !stop.load(Ordering::SeqCst) && !source.is_exhausted() && !sink.is_closed() {
        let events = match source.poll(interval) {
            Ok(events) => events,
            Err(RuntimeError::Decode(detail)) => {
                log(LogLevel::Warn, "source_decode_failed", detail);
                continue;
            }
            Err(err) => {
                log(LogLevel::Error, "source_failed", err.to_string());
                return Err(err);
            }
        };
        for event in events {
            match sink.deliver(event) {
                Ok(()) => {}
                Err(RuntimeError::Halting | RuntimeError::WorkerStopped) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }
    log(LogLevel::Debug, "source_finished", String::new());
    Ok(())
}

impl ActivityManager {
    /// Pump `source` into this manager on a dedicated thread.
    pub fn spawn_event_poller<S>(&self, source: S) -> Result<EventPoller>
    where
        S: EventSource + 'static,
    {
        EventPoller::spawn(
            source,
            self.event_sink(),
            self.poll_interval(),
            self.logger().cloned(),
        )
    }
}
