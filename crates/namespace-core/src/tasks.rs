//! Task ledger: the append-only record of every long-running user operation.
//!
//! State machine:
//!
//! ```text
//! Pending ──update──▶ Running ──complete──▶ Complete
//!    │                   │
//!    └──────fail─────────┴──────fail──────▶ Failed
//! ```
//!
//! `Complete` and `Failed` are terminal. Updates on a terminal task are
//! ignored so that late progress frames after a cancellation are harmless.

use crate::events::{CoreEvent, EventBus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TaskError {
    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),
}

pub type Result<T> = std::result::Result<T, TaskError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }
}

/// Category of a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// Device or file absent
    NotFound,
    /// Re-authentication needed; surfaced as its own alert category
    Unauthorized,
    /// Channel not open or request failed on the network
    Transport,
    /// Input rejected before any work started
    Validation,
    /// The remote side reported an error
    Remote,
}

/// User-facing description of why a task failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    /// Short title
    pub title: String,
    /// One or more human-readable lines
    pub lines: Vec<String>,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, title: impl Into<String>, line: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            lines: vec![line.into()],
        }
    }

    pub fn with_line(mut self, line: impl Into<String>) -> Self {
        self.lines.push(line.into());
        self
    }

    pub fn is_unauthorized(&self) -> bool {
        self.kind == FailureKind::Unauthorized
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub task_id: TaskId,
    pub description: String,
    pub status: TaskStatus,
    /// 0-100
    pub progress: u8,
    pub message: String,
    pub device: Option<String>,
    pub failure: Option<TaskFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Ordered, append-only ledger of tasks.
///
/// The ledger is the only writer of `Task` values; readers get clones.
pub struct TaskLedger {
    tasks: RwLock<Vec<Task>>,
    next_id: AtomicU64,
    events: Option<Arc<EventBus>>,
}

impl Default for TaskLedger {
    fn default() -> Self {
        Self {
            tasks: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            events: None,
        }
    }
}

impl TaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger that publishes `TaskChanged` on every mutation.
    pub fn with_events(events: Arc<EventBus>) -> Self {
        Self {
            events: Some(events),
            ..Self::default()
        }
    }

    fn publish(&self, task: &Task) {
        if let Some(events) = &self.events {
            events.emit(CoreEvent::TaskChanged { task: task.clone() });
        }
    }

    /// Append a new pending task and return it.
    pub fn add_task(&self, description: impl Into<String>, device: Option<&str>) -> Task {
        let now = Utc::now();
        let task = Task {
            task_id: TaskId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            description: description.into(),
            status: TaskStatus::Pending,
            progress: 0,
            message: String::new(),
            device: device.map(str::to_string),
            failure: None,
            created_at: now,
            updated_at: now,
        };
        self.tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(task.clone());
        self.publish(&task);
        task
    }

    /// Apply `f` to a non-terminal task. Returns `Ok(false)` if the task is terminal.
    fn mutate(&self, id: TaskId, f: impl FnOnce(&mut Task)) -> Result<bool> {
        let updated = {
            let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
            let task = tasks
                .iter_mut()
                .find(|t| t.task_id == id)
                .ok_or(TaskError::UnknownTask(id))?;
            if task.is_terminal() {
                return Ok(false);
            }
            f(task);
            task.updated_at = Utc::now();
            task.clone()
        };
        self.publish(&updated);
        Ok(true)
    }

    /// Record progress (clamped to 100) and move the task to `Running`.
    pub fn update_task(&self, id: TaskId, progress: u8, message: impl Into<String>) -> Result<bool> {
        let message = message.into();
        self.mutate(id, |task| {
            task.status = TaskStatus::Running;
            task.progress = progress.min(100);
            task.message = message;
        })
    }

    pub fn complete_task(&self, id: TaskId, message: impl Into<String>) -> Result<bool> {
        let message = message.into();
        self.mutate(id, |task| {
            task.status = TaskStatus::Complete;
            task.progress = 100;
            task.message = message;
        })
    }

    /// Fail a task; progress is left where it stopped.
    pub fn fail_task(&self, id: TaskId, failure: TaskFailure) -> Result<bool> {
        self.mutate(id, |task| {
            task.status = TaskStatus::Failed;
            task.message = failure.lines.join("\n");
            task.failure = Some(failure);
        })
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|t| t.task_id == id)
            .cloned()
    }

    /// All tasks in creation order.
    pub fn snapshot(&self) -> Vec<Task> {
        self.tasks.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Tasks with the given status, in creation order.
    pub fn with_status(&self, status: TaskStatus) -> Vec<Task> {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_add_task_appends_pending() {
        let ledger = TaskLedger::new();
        let a = ledger.add_task("Scan /home", Some("laptop"));
        let b = ledger.add_task("Download a.txt", None);

        assert_eq!(a.status, TaskStatus::Pending);
        assert_eq!(a.device.as_deref(), Some("laptop"));
        assert!(b.task_id > a.task_id);

        let ids: Vec<_> = ledger.snapshot().iter().map(|t| t.task_id).collect();
        assert_eq!(ids, vec![a.task_id, b.task_id]);
    }

    #[test]
    fn test_update_moves_to_running() {
        let ledger = TaskLedger::new();
        let task = ledger.add_task("Scan", None);
        assert!(ledger.update_task(task.task_id, 40, "Scanning").unwrap());

        let task = ledger.get(task.task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.progress, 40);
        assert_eq!(task.message, "Scanning");
    }

    #[test]
    fn test_progress_clamped() {
        let ledger = TaskLedger::new();
        let task = ledger.add_task("Scan", None);
        ledger.update_task(task.task_id, 250, "").unwrap();
        assert_eq!(ledger.get(task.task_id).unwrap().progress, 100);
    }

    #[test]
    fn test_complete_twice_is_idempotent() {
        let ledger = TaskLedger::new();
        let task = ledger.add_task("Upload", None);
        assert!(ledger.complete_task(task.task_id, "Done").unwrap());
        let first = ledger.get(task.task_id).unwrap();

        assert!(!ledger.complete_task(task.task_id, "Done again").unwrap());
        assert_eq!(ledger.get(task.task_id).unwrap(), first);
    }

    #[test]
    fn test_update_after_fail_is_noop() {
        let ledger = TaskLedger::new();
        let task = ledger.add_task("Download", None);
        ledger.update_task(task.task_id, 30, "Working").unwrap();
        ledger
            .fail_task(
                task.task_id,
                TaskFailure::new(FailureKind::Transport, "Download failed", "Relay closed"),
            )
            .unwrap();
        let failed = ledger.get(task.task_id).unwrap();

        assert!(!ledger.update_task(task.task_id, 90, "late frame").unwrap());
        assert!(!ledger.complete_task(task.task_id, "late").unwrap());
        let after = ledger.get(task.task_id).unwrap();
        assert_eq!(after, failed);
        assert_eq!(after.status, TaskStatus::Failed);
        assert_eq!(after.progress, 30);
        assert_eq!(after.message, "Relay closed");
    }

    #[test]
    fn test_fail_from_pending() {
        let ledger = TaskLedger::new();
        let task = ledger.add_task("Scan", None);
        let failure = TaskFailure::new(FailureKind::Unauthorized, "Scan failed", "You are not authorized")
            .with_line("Sign in again");
        ledger.fail_task(task.task_id, failure).unwrap();

        let task = ledger.get(task.task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.failure.as_ref().unwrap().is_unauthorized());
        assert_eq!(task.failure.unwrap().lines.len(), 2);
    }

    #[test]
    fn test_unknown_task_errors() {
        let ledger = TaskLedger::new();
        assert_eq!(
            ledger.update_task(TaskId(42), 1, "").unwrap_err(),
            TaskError::UnknownTask(TaskId(42))
        );
    }

    #[test]
    fn test_filter_by_status() {
        let ledger = TaskLedger::new();
        let a = ledger.add_task("a", None);
        let b = ledger.add_task("b", None);
        ledger.update_task(a.task_id, 10, "").unwrap();
        ledger.complete_task(b.task_id, "").unwrap();

        assert_eq!(ledger.with_status(TaskStatus::Running).len(), 1);
        assert_eq!(ledger.with_status(TaskStatus::Complete)[0].task_id, b.task_id);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_updates_published_in_order() {
        let events = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = events.subscribe(move |event| {
            if let CoreEvent::TaskChanged { task } = event {
                seen_clone.lock().unwrap().push((task.status, task.progress));
            }
        });

        let ledger = TaskLedger::with_events(events);
        let task = ledger.add_task("Scan", None);
        ledger.update_task(task.task_id, 50, "").unwrap();
        ledger.complete_task(task.task_id, "").unwrap();
        ledger.update_task(task.task_id, 10, "").unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (TaskStatus::Pending, 0),
                (TaskStatus::Running, 50),
                (TaskStatus::Complete, 100),
            ]
        );
    }
}
