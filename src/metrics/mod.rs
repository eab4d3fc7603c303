use crate::logging::{LogEvent, LogFields, LogLevel};
use serde_json::json;
use std::time::Duration;

/// Counters accumulated by the runtime worker.
#[derive(Debug, Default, Clone)]
pub struct RuntimeMetrics {
    events: u64,
    redraws: u64,
    launches: u64,
    conclusions: u64,
    relaunches: u64,
    activity_faults: u64,
    debounced_redraws: u64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&mut self) {
        self.events = self.events.saturating_add(1);
    }

    pub fn record_redraw(&mut self) {
        self.redraws = self.redraws.saturating_add(1);
    }

    pub fn record_launch(&mut self) {
        self.launches = self.launches.saturating_add(1);
    }

    pub fn record_conclusion(&mut self) {
        self.conclusions = self.conclusions.saturating_add(1);
    }

    pub fn record_relaunch(&mut self) {
        self.relaunches = self.relaunches.saturating_add(1);
    }

    pub fn record_fault(&mut self) {
        self.activity_faults = self.activity_faults.saturating_add(1);
    }

    /// A background redraw request that scheduled a delayed redraw.
    pub fn record_debounced_redraw(&mut self) {
        self.debounced_redraws = self.debounced_redraws.saturating_add(1);
    }

    pub fn snapshot(&self, uptime: Duration) -> MetricSnapshot {
        MetricSnapshot {
            uptime_ms: uptime.as_millis() as u64,
            events: self.events,
            redraws: self.redraws,
            launches: self.launches,
            conclusions: self.conclusions,
            relaunches: self.relaunches,
            activity_faults: self.activity_faults,
            debounced_redraws: self.debounced_redraws,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSnapshot {
    pub uptime_ms: u64,
    pub events: u64,
    pub redraws: u64,
    pub launches: u64,
    pub conclusions: u64,
    pub relaunches: u64,
    pub activity_faults: u64,
    pub debounced_redraws: u64,
}

impl MetricSnapshot {
    pub fn to_log_event(&self, target: &str) -> LogEvent {
        LogEvent::with_fields(LogLevel::Info, target, "runtime_metrics", self.as_fields())
    }

    pub fn as_fields(&self) -> LogFields {
        let mut map = LogFields::new();
        map.insert("uptime_ms".to_string(), json!(self.uptime_ms));
        map.insert("events".to_string(), json!(self.events));
        map.insert("redraws".to_string(), json!(self.redraws));
        map.insert("launches".to_string(), json!(self.launches));
        map.insert("conclusions".to_string(), json!(self.conclusions));
        map.insert("relaunches".to_string(), json!(self.relaunches));
        map.insert("activity_faults".to_string(), json!(self.activity_faults));
        map.insert("debounced_redraws".to_string(), json!(self.debounced_redraws));
        map
    }
}
