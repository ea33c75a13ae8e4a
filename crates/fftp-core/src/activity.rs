//! User-facing activity log: `(message, severity)` lines for the UI,
//! mirrored to the `log` facade.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Success,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub timestamp: DateTime<Local>,
    pub severity: Severity,
    pub message: String,
}

pub type ActivitySink = Arc<dyn Fn(&str, Severity) + Send + Sync>;

const DEFAULT_CAPACITY: usize = 1000;

/// Cheaply cloneable handle; clones share history and sink.
#[derive(Clone)]
pub struct ActivityLog {
    history: Arc<Mutex<VecDeque<ActivityEntry>>>,
    sink: Option<ActivitySink>,
    capacity: usize,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityLog {
    pub fn new() -> Self {
        Self {
            history: Arc::new(Mutex::new(VecDeque::new())),
            sink: None,
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Forward every line to `sink` (typically the UI's log panel).
    pub fn with_sink(mut self, sink: ActivitySink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn log(&self, message: impl Into<String>, severity: Severity) {
        let message = message.into();
        match severity {
            Severity::Info | Severity::Success => log::info!("{}", message),
            Severity::Warning => log::warn!("{}", message),
            Severity::Error => log::error!("{}", message),
        }
        if let Ok(mut h) = self.history.lock() {
            if h.len() >= self.capacity {
                h.pop_front();
            }
            h.push_back(ActivityEntry {
                timestamp: Local::now(),
                severity,
                message: message.clone(),
            });
        }
        if let Some(sink) = &self.sink {
            sink(&message, severity);
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(message, Severity::Info);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(message, Severity::Warning);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(message, Severity::Error);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.log(message, Severity::Success);
    }

    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_receives_lines_and_history_is_bounded() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let log = ActivityLog::new()
            .with_capacity(2)
            .with_sink(Arc::new(move |m, sev| s.lock().unwrap().push((m.to_string(), sev))));
        log.info("one");
        log.warning("two");
        log.success("three");

        assert_eq!(seen.lock().unwrap().len(), 3);
        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "two");
        assert_eq!(entries[1].severity, Severity::Success);
    }
}
