//! Per-task log capture.

use std::collections::VecDeque;
use std::sync::Arc;

use log::Level;
use parking_lot::Mutex;

/// Log target used when forwarding task lines to the process logger.
pub const TASK_LOG_TARGET: &str = "igdm::task";

/// Oldest lines are dropped past this point.
const MAX_LINES: usize = 5_000;

/// In-memory log sink owned by one task.
///
/// Every line is forwarded to the `log` facade and kept in the task's own
/// buffer, formatted as `<timestamp> - <LEVEL> - <message>`. Clones share
/// the same buffer.
#[derive(Debug, Clone)]
pub struct TaskLog {
    label: Arc<str>,
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl TaskLog {
    /// Create a sink whose forwarded lines are prefixed with `label`.
    #[must_use]
    pub fn new(label: &str) -> Self {
        Self {
            label: Arc::from(label),
            lines: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Label used when forwarding lines.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Record a debug line.
    pub fn debug(&self, message: impl AsRef<str>) {
        self.record(Level::Debug, message.as_ref());
    }

    /// Record an info line.
    pub fn info(&self, message: impl AsRef<str>) {
        self.record(Level::Info, message.as_ref());
    }

    /// Record a warning.
    pub fn warn(&self, message: impl AsRef<str>) {
        self.record(Level::Warn, message.as_ref());
    }

    /// Record an error.
    pub fn error(&self, message: impl AsRef<str>) {
        self.record(Level::Error, message.as_ref());
    }

    fn record(&self, level: Level, message: &str) {
        log::log!(target: TASK_LOG_TARGET, level, "[{}] {message}", self.label);

        let line = format!(
            "{} - {level} - {message}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        let mut lines = self.lines.lock();
        if lines.len() == MAX_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Whether nothing has been captured yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    /// Captured lines, oldest first.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    /// Captured text, one line per entry.
    #[must_use]
    pub fn contents(&self) -> String {
        let mut out = String::new();
        for line in self.lines.lock().iter() {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_levels_in_order() {
        let log = TaskLog::new("task_a_1");
        assert!(log.is_empty());

        log.info("logged in");
        log.warn("rate limited");
        log.error("send failed");

        let lines = log.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with(" - INFO - logged in"));
        assert!(lines[1].ends_with(" - WARN - rate limited"));
        assert!(lines[2].ends_with(" - ERROR - send failed"));
        assert_eq!(log.contents().lines().count(), 3);
    }

    #[test]
    fn clones_share_one_buffer_and_tasks_do_not() {
        let first = TaskLog::new("first");
        let second = TaskLog::new("second");
        let alias = first.clone();

        alias.info("from the worker");
        second.info("other task");

        assert_eq!(first.lines().len(), 1);
        assert!(first.contents().contains("from the worker"));
        assert!(!first.contents().contains("other task"));
    }

    #[test]
    fn buffer_is_bounded() {
        let log = TaskLog::new("busy");
        for i in 0..(MAX_LINES + 10) {
            log.debug(format!("line {i}"));
        }
        let lines = log.lines();
        assert_eq!(lines.len(), MAX_LINES);
        assert!(lines[0].ends_with("line 10"));
    }
}
