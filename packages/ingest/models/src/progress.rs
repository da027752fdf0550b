//! Progress reporting hooks for running tasks.
//!
//! The task tracker calls a [`ProgressCallback`] after every mutation so a
//! renderer (an `indicatif` bar in the CLI, nothing in tests) can follow
//! along without polling.

use std::sync::Arc;

use crate::{PhaseCounters, TaskId, TaskProgress, TaskStatus};

/// Receives task progress as it happens.
///
/// Implementations must be `Send + Sync`; they are called from whichever
/// tokio worker is driving the task.
pub trait ProgressCallback: Send + Sync {
    /// Progress or counters changed.
    fn on_progress(&self, task_id: TaskId, progress: TaskProgress, counters: PhaseCounters);

    /// Processing of a group began. `position` is 1-based.
    fn on_group_started(&self, task_id: TaskId, group_id: i64, position: usize, of: usize);

    /// The task reached a terminal status.
    fn on_finished(&self, task_id: TaskId, status: TaskStatus, summary: &str);
}

/// Ignores all progress updates.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn on_progress(&self, _task_id: TaskId, _progress: TaskProgress, _counters: PhaseCounters) {}
    fn on_group_started(&self, _task_id: TaskId, _group_id: i64, _position: usize, _of: usize) {}
    fn on_finished(&self, _task_id: TaskId, _status: TaskStatus, _summary: &str) {}
}

/// Returns a shared [`NullProgress`] instance.
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
