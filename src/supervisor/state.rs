//! Worker-side task state tracking
//!
//! Tracks in-flight requests by `taskId` and keeps running totals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use crate::protocol::RequestKind;

// ─────────────────────────────────────────────────────────────────
// Task State
// ─────────────────────────────────────────────────────────────────

/// Lifecycle of one request inside the worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TaskState {
    /// Accepted, not yet started
    #[default]
    Queued,
    /// Handler running
    Running,
    /// Terminal result `ok: true` sent
    Completed,
    /// Terminal result `ok: false` sent (includes contained panics)
    Failed,
}

impl TaskState {
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Queued | TaskState::Running)
    }
}

/// One tracked request
#[derive(Debug, Clone)]
pub struct TrackedTask {
    pub task_id: String,
    pub kind: RequestKind,
    pub state: TaskState,
    pub received_at: Instant,
    pub started_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    pub error: Option<String>,
}

impl TrackedTask {
    fn new(task_id: String, kind: RequestKind) -> Self {
        Self {
            task_id,
            kind,
            state: TaskState::Queued,
            received_at: Instant::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Handler time in milliseconds (so far, if still running)
    pub fn execution_time_ms(&self) -> u64 {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).as_millis() as u64,
            (Some(start), None) => start.elapsed().as_millis() as u64,
            _ => 0,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Task Tracker
// ─────────────────────────────────────────────────────────────────

/// Tracks active and recently finished requests
#[derive(Default)]
pub struct TaskTracker {
    tasks: RwLock<HashMap<String, TrackedTask>>,
    completed_count: AtomicU64,
    failed_count: AtomicU64,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a request; `false` if that taskId is already active
    pub fn add_task(&self, task_id: &str, kind: RequestKind) -> bool {
        let mut tasks = self.tasks.write();
        if tasks.get(task_id).is_some_and(|t| t.state.is_active()) {
            return false;
        }
        tasks.insert(task_id.to_string(), TrackedTask::new(task_id.to_string(), kind));
        true
    }

    pub fn mark_running(&self, task_id: &str) -> bool {
        let mut tasks = self.tasks.write();
        match tasks.get_mut(task_id) {
            Some(task) => {
                task.state = TaskState::Running;
                task.started_at = Some(Instant::now());
                true
            }
            None => false,
        }
    }

    pub fn mark_completed(&self, task_id: &str) {
        if let Some(task) = self.tasks.write().get_mut(task_id) {
            task.state = TaskState::Completed;
            task.completed_at = Some(Instant::now());
            self.completed_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn mark_failed(&self, task_id: &str, error: impl Into<String>) {
        if let Some(task) = self.tasks.write().get_mut(task_id) {
            task.state = TaskState::Failed;
            task.completed_at = Some(Instant::now());
            task.error = Some(error.into());
            self.failed_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Copy of one task's record
    pub fn get(&self, task_id: &str) -> Option<TrackedTask> {
        self.tasks.read().get(task_id).cloned()
    }

    /// IDs of queued or running requests
    pub fn active_task_ids(&self) -> Vec<String> {
        self.tasks
            .read()
            .values()
            .filter(|t| t.state.is_active())
            .map(|t| t.task_id.clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.tasks.read().values().filter(|t| t.state.is_active()).count()
    }

    pub fn total_completed(&self) -> u64 {
        self.completed_count.load(Ordering::Relaxed)
    }

    pub fn total_failed(&self) -> u64 {
        self.failed_count.load(Ordering::Relaxed)
    }

    /// Drop the oldest finished records, keeping at most `keep_count`
    pub fn cleanup_old_tasks(&self, keep_count: usize) {
        let mut tasks = self.tasks.write();

        let mut finished: Vec<_> = tasks
            .values()
            .filter(|t| !t.state.is_active())
            .map(|t| (t.task_id.clone(), t.completed_at))
            .collect();

        finished.sort_by(|a, b| a.1.cmp(&b.1));

        let to_remove = finished.len().saturating_sub(keep_count);
        for (id, _) in finished.into_iter().take(to_remove) {
            tasks.remove(&id);
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
