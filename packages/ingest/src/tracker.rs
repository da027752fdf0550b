//! Per-task mutable state shared between the orchestrator and pollers.
//!
//! Each task lives behind its own mutex. The orchestrator is the only
//! writer; [`TaskTracker::snapshot`] copies the task out under the lock, so
//! a reader never sees a half-applied update and never holds the lock
//! longer than a clone.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use vk_ingest_models::progress::{ProgressCallback, null_progress};
use vk_ingest_models::{
    FetchTask, GroupOutcome, PhaseCounters, TaskError, TaskId, TaskProgress, TaskStatus,
    TaskStatusView,
};

/// Default cap on the per-task error list.
pub const DEFAULT_MAX_ERRORS: usize = 50;

/// Change to apply to a task's progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressDelta {
    /// Work units resolved.
    pub processed: u64,
    /// Work units newly discovered.
    pub total: u64,
}

impl ProgressDelta {
    #[must_use]
    pub const fn processed(n: u64) -> Self {
        Self {
            processed: n,
            total: 0,
        }
    }

    #[must_use]
    pub const fn discovered(n: u64) -> Self {
        Self {
            processed: 0,
            total: n,
        }
    }
}

/// Registry of task state.
pub struct TaskTracker {
    tasks: RwLock<BTreeMap<TaskId, Arc<Mutex<FetchTask>>>>,
    max_errors: usize,
    progress: Arc<dyn ProgressCallback>,
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ERRORS, null_progress())
    }
}

impl TaskTracker {
    /// Creates an empty tracker keeping at most `max_errors` errors per
    /// task and reporting every change to `progress`.
    #[must_use]
    pub fn new(max_errors: usize, progress: Arc<dyn ProgressCallback>) -> Self {
        Self {
            tasks: RwLock::new(BTreeMap::new()),
            max_errors: max_errors.max(1),
            progress,
        }
    }

    /// Registers a pending task for `group_ids` and returns its id.
    pub fn create(&self, group_ids: Vec<i64>) -> TaskId {
        let task = FetchTask::new(group_ids);
        let task_id = task.task_id;

        self.tasks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(task_id, Arc::new(Mutex::new(task)));

        log::debug!("[task {task_id}] created");
        task_id
    }

    fn entry(&self, task_id: TaskId) -> Option<Arc<Mutex<FetchTask>>> {
        self.tasks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&task_id)
            .cloned()
    }

    /// Applies `f` to a non-terminal task. Returns `None` (and logs) if the
    /// task is unknown or already terminal.
    fn mutate<R>(
        &self,
        task_id: TaskId,
        op: &str,
        f: impl FnOnce(&mut FetchTask) -> R,
    ) -> Option<R> {
        let Some(entry) = self.entry(task_id) else {
            log::warn!("[task {task_id}] {op}: unknown task");
            return None;
        };

        let (result, progress, counters) = {
            let mut task = entry
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if task.status.is_terminal() {
                log::warn!(
                    "[task {task_id}] {op} ignored: task is already {}",
                    task.status
                );
                return None;
            }
            let result = f(&mut task);
            (result, task.progress, task.counters)
        };

        self.progress.on_progress(task_id, progress, counters);
        Some(result)
    }

    /// Adds resolved and discovered work units. `total` is raised to at
    /// least `processed`.
    pub fn update_progress(&self, task_id: TaskId, delta: ProgressDelta) -> bool {
        self.mutate(task_id, "update_progress", |task| {
            let progress = &mut task.progress;
            progress.total += delta.total;
            progress.processed += delta.processed;
            if progress.processed > progress.total {
                progress.total = progress.processed;
            }
        })
        .is_some()
    }

    /// Updates the phase counters.
    pub fn update_counters(&self, task_id: TaskId, f: impl FnOnce(&mut PhaseCounters)) -> bool {
        self.mutate(task_id, "update_counters", |task| f(&mut task.counters))
            .is_some()
    }

    /// Appends an error. Once the list holds the configured maximum,
    /// further errors only bump `errors_truncated`.
    pub fn record_error(&self, task_id: TaskId, error: TaskError) -> bool {
        let max_errors = self.max_errors;
        self.mutate(task_id, "record_error", |task| {
            task.counters.errors += 1;
            task.last_error = Some(error.message.clone());
            if task.errors.len() < max_errors {
                task.errors.push(error);
            } else {
                task.errors_truncated += 1;
            }
        })
        .is_some()
    }

    /// Records how a group ended.
    pub fn set_group_outcome(&self, task_id: TaskId, group_id: i64, outcome: GroupOutcome) -> bool {
        self.mutate(task_id, "set_group_outcome", |task| {
            if let Some(result) = task.groups.iter_mut().find(|g| g.group_id == group_id) {
                result.outcome = outcome;
            }
        })
        .is_some()
    }

    /// Moves the task to `status` if that is a forward transition.
    ///
    /// Backward or sideways transitions, and any transition out of a
    /// terminal status, are logged and ignored. Returns whether the status
    /// changed.
    pub fn transition(&self, task_id: TaskId, status: TaskStatus) -> bool {
        self.apply_transition(task_id, None, status, None)
    }

    /// Moves the task to a terminal `status` and stores `summary`.
    pub fn finish(&self, task_id: TaskId, status: TaskStatus, summary: String) -> bool {
        self.apply_transition(task_id, None, status, Some(summary))
    }

    /// Cancels the task only if it has not started running yet.
    pub fn cancel_pending(&self, task_id: TaskId) -> bool {
        self.apply_transition(
            task_id,
            Some(TaskStatus::Pending),
            TaskStatus::Cancelled,
            Some("Cancelled before start".to_owned()),
        )
    }

    /// Reports that `group_id` is about to be processed.
    pub fn group_started(&self, task_id: TaskId, group_id: i64, position: usize, of: usize) {
        log::info!("[task {task_id}] group {group_id} ({position}/{of})");
        self.progress.on_group_started(task_id, group_id, position, of);
    }

    fn apply_transition(
        &self,
        task_id: TaskId,
        from: Option<TaskStatus>,
        status: TaskStatus,
        summary: Option<String>,
    ) -> bool {
        let Some(entry) = self.entry(task_id) else {
            log::warn!("[task {task_id}] transition to {status}: unknown task");
            return false;
        };

        let summary_text = {
            let mut task = entry
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);

            if from.is_some_and(|from| task.status != from) {
                return false;
            }
            if !task.status.can_transition_to(status) {
                log::warn!(
                    "[task {task_id}] ignoring transition {} -> {status}",
                    task.status
                );
                return false;
            }

            let now = Utc::now();
            match status {
                TaskStatus::Running => task.started_at = Some(now),
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                    task.completed_at = Some(now);
                }
                TaskStatus::Pending => {}
            }
            if status == TaskStatus::Cancelled {
                for group in &mut task.groups {
                    if group.outcome == GroupOutcome::Pending {
                        group.outcome = GroupOutcome::Cancelled;
                    }
                }
            }
            if summary.is_some() {
                task.summary = summary;
            }

            log::info!("[task {task_id}] {} -> {status}", task.status);
            task.status = status;
            task.summary.clone().unwrap_or_default()
        };

        if status.is_terminal() {
            self.progress.on_finished(task_id, status, &summary_text);
        }
        true
    }

    /// Drops a finished task and returns its final state. Tasks that are
    /// still pending or running are kept.
    pub fn remove(&self, task_id: TaskId) -> Option<FetchTask> {
        let mut tasks = self
            .tasks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let task = tasks
            .get(&task_id)?
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if !task.status.is_terminal() {
            return None;
        }

        tasks.remove(&task_id);
        log::debug!("[task {task_id}] removed");
        Some(task)
    }

    /// Drops every finished task and returns their ids.
    pub fn prune_finished(&self) -> Vec<TaskId> {
        let mut tasks = self
            .tasks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let finished: Vec<TaskId> = tasks
            .iter()
            .filter(|(_, entry)| {
                entry
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .status
                    .is_terminal()
            })
            .map(|(task_id, _)| *task_id)
            .collect();

        for task_id in &finished {
            tasks.remove(task_id);
        }
        if !finished.is_empty() {
            log::debug!("pruned {} finished task(s)", finished.len());
        }
        finished
    }

    /// Copy of the task's current state.
    #[must_use]
    pub fn snapshot(&self, task_id: TaskId) -> Option<FetchTask> {
        self.entry(task_id).map(|entry| {
            entry
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        })
    }

    /// The polled status payload for a task.
    #[must_use]
    pub fn status_view(&self, task_id: TaskId) -> Option<TaskStatusView> {
        self.snapshot(task_id).map(|task| task.status_view())
    }

    /// Current status without copying the whole task.
    #[must_use]
    pub fn status(&self, task_id: TaskId) -> Option<TaskStatus> {
        self.entry(task_id).map(|entry| {
            entry
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .status
        })
    }

    /// Current progress without copying the whole task.
    #[must_use]
    pub fn progress(&self, task_id: TaskId) -> Option<TaskProgress> {
        self.entry(task_id).map(|entry| {
            entry
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .progress
        })
    }

    /// Snapshots of every known task, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<FetchTask> {
        let entries: Vec<_> = self
            .tasks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut tasks: Vec<FetchTask> = entries
            .iter()
            .map(|entry| {
                entry
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .clone()
            })
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        tasks
    }
}
