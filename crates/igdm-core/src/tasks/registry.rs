//! Bounded in-memory task registry.
//!
//! Records are created synchronously when a job is submitted and mutated by the
//! worker as it runs. Finished records expire after a TTL. When the registry is
//! full the oldest finished record makes room; if every slot holds an active
//! task, creation is refused.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::pipeline::OutreachSummary;
use crate::tasks::{TaskLog, TaskStatus};

/// Why a registry operation was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No task with this identifier.
    #[error("task not found: {0}")]
    NotFound(String),

    /// Every slot holds an active task.
    #[error("too many active tasks (capacity {capacity})")]
    Full {
        /// Configured capacity.
        capacity: usize,
    },

    /// The account already has a task in progress.
    #[error("a task is already running for {username} ({task_id})")]
    AccountBusy {
        /// Account handle.
        username: String,
        /// The task in progress.
        task_id: String,
    },

    /// The task already reached a terminal state.
    #[error("task {task_id} already finished with status {status}")]
    AlreadyFinished {
        /// Task identifier.
        task_id: String,
        /// Terminal status.
        status: TaskStatus,
    },
}

/// What a worker needs to run a freshly registered task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    /// Task identifier.
    pub id: String,
    /// Log sink owned by the task.
    pub log: TaskLog,
    /// Fires when the task is cancelled.
    pub cancel: CancellationToken,
}

/// Reports a running task's counters back to its registry record.
#[derive(Debug, Clone)]
pub struct TaskProgress {
    registry: Arc<TaskRegistry>,
    task_id: String,
}

impl TaskProgress {
    /// Progress reporter for `task_id`.
    #[must_use]
    pub fn new(registry: Arc<TaskRegistry>, task_id: impl Into<String>) -> Self {
        Self {
            registry,
            task_id: task_id.into(),
        }
    }

    /// Publish the counters of a partial summary.
    pub fn update(&self, summary: &OutreachSummary) {
        self.registry.record_progress(&self.task_id, summary);
    }
}

/// Point-in-time view of a task record, as served by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSnapshot {
    /// Task identifier.
    pub task_id: String,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Messages sent.
    pub success: u32,
    /// Per-user failures.
    pub failed: u32,
    /// Candidates processed so far, updated after each one.
    pub attempted: u32,
    /// Human-readable status line.
    pub message: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Captured log text, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
}

/// One entry of the log listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    /// Task identifier.
    pub task_id: String,
    /// Unix seconds when the task was created.
    pub timestamp: String,
    /// Captured log text.
    pub logs: String,
}

#[derive(Debug)]
struct TaskEntry {
    username: String,
    status: TaskStatus,
    success: u32,
    failed: u32,
    attempted: u32,
    message: String,
    created_at: DateTime<Utc>,
    finished_at: Option<Instant>,
    log: TaskLog,
    cancel: CancellationToken,
}

impl TaskEntry {
    fn snapshot(&self, task_id: &str) -> TaskSnapshot {
        TaskSnapshot {
            task_id: task_id.to_string(),
            status: self.status,
            success: self.success,
            failed: self.failed,
            attempted: self.attempted,
            message: self.message.clone(),
            created_at: self.created_at,
            logs: (!self.log.is_empty()).then(|| self.log.contents()),
        }
    }

    fn finish(&mut self, status: TaskStatus, message: String) {
        self.status = status;
        self.message = message;
        self.finished_at = Some(Instant::now());
    }
}

/// Shared registry of outreach tasks.
#[derive(Debug)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, TaskEntry>>,
    capacity: usize,
    ttl: Duration,
}

impl TaskRegistry {
    /// Create a registry holding at most `capacity` records.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Create a registry from server settings.
    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.task_capacity, Duration::from_secs(config.task_ttl_secs))
    }

    /// Register a new task for `username`.
    ///
    /// # Errors
    ///
    /// Returns an error if the account already has an active task, or every
    /// slot holds an active task.
    pub fn create(&self, username: &str) -> Result<TaskHandle, RegistryError> {
        let mut tasks = self.tasks.write();
        self.evict_expired(&mut tasks);

        if let Some((task_id, _)) = tasks
            .iter()
            .find(|(_, entry)| entry.username == username && !entry.status.is_finished())
        {
            return Err(RegistryError::AccountBusy {
                username: username.to_string(),
                task_id: task_id.clone(),
            });
        }

        if tasks.len() >= self.capacity {
            let oldest = tasks
                .iter()
                .filter(|(_, entry)| entry.status.is_finished())
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    log::debug!("evicting finished task {id} to make room");
                    tasks.remove(&id);
                }
                None => {
                    return Err(RegistryError::Full {
                        capacity: self.capacity,
                    });
                }
            }
        }

        let created_at = Utc::now();
        let base = format!("task_{username}_{}", created_at.timestamp());
        let mut id = base.clone();
        let mut suffix = 1;
        while tasks.contains_key(&id) {
            suffix += 1;
            id = format!("{base}_{suffix}");
        }

        let handle = TaskHandle {
            id: id.clone(),
            log: TaskLog::new(&id),
            cancel: CancellationToken::new(),
        };
        tasks.insert(
            id,
            TaskEntry {
                username: username.to_string(),
                status: TaskStatus::Starting,
                success: 0,
                failed: 0,
                attempted: 0,
                message: "Starting task...".to_string(),
                created_at,
                finished_at: None,
                log: handle.log.clone(),
                cancel: handle.cancel.clone(),
            },
        );
        drop(tasks);
        Ok(handle)
    }

    /// Move a task into `processing`.
    pub fn mark_processing(&self, task_id: &str) {
        if let Some(entry) = self.tasks.write().get_mut(task_id) {
            if !entry.status.is_finished() {
                entry.status = TaskStatus::Processing;
                entry.message = "Processing...".to_string();
            }
        }
    }

    /// Copy the running counters of an unfinished task.
    pub fn record_progress(&self, task_id: &str, summary: &OutreachSummary) {
        if let Some(entry) = self.tasks.write().get_mut(task_id) {
            if !entry.status.is_finished() {
                entry.success = summary.success;
                entry.failed = summary.failed;
                entry.attempted = summary.attempted;
            }
        }
    }

    /// Record the pipeline outcome.
    pub fn finish(&self, task_id: &str, summary: &OutreachSummary) {
        if let Some(entry) = self.tasks.write().get_mut(task_id) {
            entry.success = summary.success;
            entry.failed = summary.failed;
            entry.attempted = summary.attempted;
            entry.finish(summary.status, summary.message.clone());
        }
    }

    /// Mark a task as failed before or outside the pipeline.
    pub fn fail(&self, task_id: &str, message: &str) {
        if let Some(entry) = self.tasks.write().get_mut(task_id) {
            entry.finish(TaskStatus::Error, message.to_string());
        }
    }

    /// Mark a task as cancelled before the pipeline produced a summary.
    pub fn mark_cancelled(&self, task_id: &str) {
        if let Some(entry) = self.tasks.write().get_mut(task_id) {
            entry.finish(TaskStatus::Cancelled, "Task cancelled".to_string());
        }
    }

    /// Request cancellation of an active task.
    ///
    /// # Errors
    ///
    /// Returns an error if the task is unknown or already finished.
    pub fn cancel(&self, task_id: &str) -> Result<(), RegistryError> {
        let tasks = self.tasks.read();
        let entry = tasks
            .get(task_id)
            .ok_or_else(|| RegistryError::NotFound(task_id.to_string()))?;
        if entry.status.is_finished() {
            return Err(RegistryError::AlreadyFinished {
                task_id: task_id.to_string(),
                status: entry.status,
            });
        }
        entry.cancel.cancel();
        entry.log.warn("Cancellation requested");
        drop(tasks);
        Ok(())
    }

    /// Current view of a task.
    #[must_use]
    pub fn snapshot(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.tasks
            .read()
            .get(task_id)
            .map(|entry| entry.snapshot(task_id))
    }

    /// Every task with captured logs, newest first.
    #[must_use]
    pub fn logs(&self) -> Vec<LogEntry> {
        let mut entries: Vec<_> = self
            .tasks
            .read()
            .iter()
            .filter(|(_, entry)| !entry.log.is_empty())
            .map(|(id, entry)| (entry.created_at, id.clone(), entry.log.contents()))
            .collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

        entries
            .into_iter()
            .map(|(created_at, task_id, logs)| LogEntry {
                task_id,
                timestamp: created_at.timestamp().to_string(),
                logs,
            })
            .collect()
    }

    /// Number of records currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    /// Whether the registry holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    fn evict_expired(&self, tasks: &mut HashMap<String, TaskEntry>) {
        let ttl = self.ttl;
        tasks.retain(|id, entry| {
            let keep = entry
                .finished_at
                .is_none_or(|finished| finished.elapsed() < ttl);
            if !keep {
                log::debug!("task {id} expired");
            }
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn summary(status: TaskStatus, success: u32, failed: u32) -> OutreachSummary {
        OutreachSummary {
            status,
            attempted: success + failed,
            success,
            failed,
            message: format!("DM sending complete: {success} succeeded, {failed} failed"),
            ..OutreachSummary::default()
        }
    }

    #[test]
    fn lifecycle_is_visible_through_snapshots() {
        let registry = TaskRegistry::new(8, HOUR);
        let handle = registry.create("alice").expect("create");
        assert!(handle.id.starts_with("task_alice_"));

        let snap = registry.snapshot(&handle.id).expect("snapshot");
        assert_eq!(snap.status, TaskStatus::Starting);
        assert_eq!(snap.logs, None);

        registry.mark_processing(&handle.id);
        handle.log.info("logged in");
        let snap = registry.snapshot(&handle.id).expect("snapshot");
        assert_eq!(snap.status, TaskStatus::Processing);
        assert!(snap.logs.as_deref().is_some_and(|l| l.contains("logged in")));

        registry.finish(&handle.id, &summary(TaskStatus::Complete, 3, 1));
        let snap = registry.snapshot(&handle.id).expect("snapshot");
        assert_eq!(snap.status, TaskStatus::Complete);
        assert_eq!((snap.success, snap.failed, snap.attempted), (3, 1, 4));
    }

    #[test]
    fn progress_is_visible_while_processing() {
        let registry = Arc::new(TaskRegistry::new(8, HOUR));
        let handle = registry.create("alice").expect("create");
        registry.mark_processing(&handle.id);

        let progress = TaskProgress::new(Arc::clone(&registry), &handle.id);
        progress.update(&summary(TaskStatus::Processing, 1, 1));
        let snap = registry.snapshot(&handle.id).expect("snapshot");
        assert_eq!(snap.status, TaskStatus::Processing);
        assert_eq!((snap.success, snap.failed, snap.attempted), (1, 1, 2));

        registry.finish(&handle.id, &summary(TaskStatus::Complete, 2, 1));
        progress.update(&summary(TaskStatus::Processing, 0, 0));
        let snap = registry.snapshot(&handle.id).expect("snapshot");
        assert_eq!((snap.success, snap.failed, snap.attempted), (2, 1, 3));
    }

    #[test]
    fn snapshot_serializes_lowercase_status() {
        let registry = TaskRegistry::new(8, HOUR);
        let handle = registry.create("alice").expect("create");
        registry.fail(&handle.id, "login failed");

        let json = serde_json::to_value(registry.snapshot(&handle.id).expect("snapshot"))
            .expect("serialize");
        assert_eq!(json["status"], "error");
        assert_eq!(json["message"], "login failed");
        assert!(json.get("logs").is_none());
    }

    #[test]
    fn one_active_task_per_account() {
        let registry = TaskRegistry::new(8, HOUR);
        let first = registry.create("alice").expect("create");
        assert!(matches!(
            registry.create("alice"),
            Err(RegistryError::AccountBusy { .. })
        ));
        registry.create("bob").expect("other account");

        registry.fail(&first.id, "done");
        let second = registry.create("alice").expect("after finish");
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn full_registry_evicts_oldest_finished() {
        let registry = TaskRegistry::new(2, HOUR);
        let a = registry.create("a").expect("create");
        let b = registry.create("b").expect("create");
        assert_eq!(
            registry.create("c").map(|h| h.id),
            Err(RegistryError::Full { capacity: 2 })
        );

        registry.fail(&a.id, "done");
        let c = registry.create("c").expect("evicts a");
        assert!(registry.snapshot(&a.id).is_none());
        assert!(registry.snapshot(&b.id).is_some());
        assert!(registry.snapshot(&c.id).is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn finished_tasks_expire() {
        let registry = TaskRegistry::new(8, Duration::ZERO);
        let a = registry.create("a").expect("create");
        registry.fail(&a.id, "done");
        let running = registry.create("b").expect("create");

        registry.create("c").expect("create");
        assert!(registry.snapshot(&a.id).is_none());
        assert!(registry.snapshot(&running.id).is_some());
    }

    #[test]
    fn cancel_fires_token_once() {
        let registry = TaskRegistry::new(8, HOUR);
        let handle = registry.create("alice").expect("create");

        registry.cancel(&handle.id).expect("cancel");
        assert!(handle.cancel.is_cancelled());

        registry.mark_cancelled(&handle.id);
        assert!(matches!(
            registry.cancel(&handle.id),
            Err(RegistryError::AlreadyFinished {
                status: TaskStatus::Cancelled,
                ..
            })
        ));
        assert!(matches!(
            registry.cancel("task_nobody_0"),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn logs_list_only_tasks_with_output() {
        let registry = TaskRegistry::new(8, HOUR);
        let quiet = registry.create("quiet").expect("create");
        let chatty = registry.create("chatty").expect("create");
        chatty.log.info("hello");

        let logs = registry.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].task_id, chatty.id);
        assert!(logs[0].logs.contains("hello"));
        assert!(!logs.iter().any(|e| e.task_id == quiet.id));
    }

    #[test]
    fn logs_are_listed_newest_first() {
        let registry = TaskRegistry::new(8, HOUR);
        let older = registry.create("older").expect("create");
        older.log.info("first");
        std::thread::sleep(Duration::from_millis(10));
        let newer = registry.create("newer").expect("create");
        newer.log.info("second");
        std::thread::sleep(Duration::from_millis(10));
        let newest = registry.create("newest").expect("create");
        newest.log.info("third");

        let ids: Vec<_> = registry.logs().into_iter().map(|e| e.task_id).collect();
        assert_eq!(ids, vec![newest.id, newer.id, older.id]);
    }

    #[test]
    fn same_second_ids_stay_unique() {
        let registry = TaskRegistry::new(8, HOUR);
        let first = registry.create("alice").expect("create");
        registry.fail(&first.id, "done");
        let second = registry.create("alice").expect("create");
        assert_ne!(first.id, second.id);
        assert!(second.id.starts_with("task_alice_"));
    }
}
