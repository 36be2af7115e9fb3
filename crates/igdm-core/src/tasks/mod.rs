//! Background outreach tasks: lifecycle, per-task logs, and the registry clients poll.

pub mod log;
pub mod registry;

use serde::{Deserialize, Serialize};

pub use self::log::{TASK_LOG_TARGET, TaskLog};
pub use registry::{
    LogEntry, RegistryError, TaskHandle, TaskProgress, TaskRegistry, TaskSnapshot,
};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Registered, waiting for a worker slot.
    #[default]
    Starting,
    /// Logging in or working through candidates.
    Processing,
    /// The pipeline ran to the end.
    Complete,
    /// Login failed, nothing to do, or the pipeline could not continue.
    Error,
    /// Stopped on request.
    Cancelled,
}

impl TaskStatus {
    /// Whether the task has reached a terminal state.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }

    /// Lowercase name as it appears in API payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
