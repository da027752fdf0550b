//! Spawns ingestion runs and exposes status and cancellation by task id.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vk_ingest_models::{FetchTask, TaskId, TaskStatus, TaskStatusView};

use crate::Ingestor;

struct Run {
    cancel: CancellationToken,
    handle: Option<JoinHandle<TaskStatus>>,
}

/// Front door for the presentation layer.
///
/// Each submitted task runs on its own tokio task with a child of the
/// manager's root [`CancellationToken`], so [`Self::cancel_all`] stops
/// every run at once.
pub struct TaskManager {
    ingestor: Arc<Ingestor>,
    root: CancellationToken,
    runs: Mutex<BTreeMap<TaskId, Run>>,
}

impl TaskManager {
    #[must_use]
    pub fn new(ingestor: Arc<Ingestor>) -> Self {
        Self {
            ingestor,
            root: CancellationToken::new(),
            runs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Creates a pending task for `group_ids` and starts it in the
    /// background.
    pub fn submit(&self, group_ids: Vec<i64>) -> TaskId {
        let task_id = self.ingestor.tracker().create(group_ids);
        let cancel = self.root.child_token();

        let ingestor = Arc::clone(&self.ingestor);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { ingestor.run(task_id, token).await });

        self.runs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(
                task_id,
                Run {
                    cancel,
                    handle: Some(handle),
                },
            );

        log::info!("[task {task_id}] submitted");
        task_id
    }

    /// Requests cooperative cancellation. Returns `false` for an unknown
    /// task.
    ///
    /// A task that has not started yet is marked cancelled right away; a
    /// running one stops at its next rate-limit wait, backoff sleep, or
    /// post boundary.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        let cancel = self
            .runs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&task_id)
            .map(|run| run.cancel.clone());

        let Some(cancel) = cancel else {
            return false;
        };

        log::info!("[task {task_id}] cancellation requested");
        cancel.cancel();
        self.ingestor.tracker().cancel_pending(task_id);
        true
    }

    /// Cancels every known task.
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    /// The polled status payload.
    #[must_use]
    pub fn status(&self, task_id: TaskId) -> Option<TaskStatusView> {
        self.ingestor.tracker().status_view(task_id)
    }

    /// Waits for the run to end and returns its final status.
    ///
    /// Returns `None` for an unknown task. Waiting on a task that was
    /// already awaited returns its recorded status.
    pub async fn wait(&self, task_id: TaskId) -> Option<TaskStatus> {
        let handle = self
            .runs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get_mut(&task_id)?
            .handle
            .take();

        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            log::error!("[task {task_id}] run aborted: {e}");
            self.ingestor.tracker().finish(
                task_id,
                TaskStatus::Failed,
                format!("Run aborted: {e}"),
            );
        }

        self.ingestor.tracker().status(task_id)
    }

    /// Forgets a finished task and returns its final state. Pending and
    /// running tasks are kept and `None` is returned.
    pub fn remove(&self, task_id: TaskId) -> Option<FetchTask> {
        let task = self.ingestor.tracker().remove(task_id)?;
        self.runs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&task_id);
        Some(task)
    }

    /// Forgets every finished task. Returns how many were dropped.
    pub fn prune_finished(&self) -> usize {
        let finished = self.ingestor.tracker().prune_finished();
        let mut runs = self
            .runs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for task_id in &finished {
            runs.remove(task_id);
        }
        finished.len()
    }

    /// Snapshots of every task, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<FetchTask> {
        self.ingestor.tracker().list()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use vk_ingest_database::memory::MemoryStore;

    use super::*;
    use crate::test_support::{MockApi, ingestor, test_config};

    fn manager(api: MockApi) -> (TaskManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let ingestor = ingestor(Arc::new(api), store.clone(), test_config());
        (TaskManager::new(Arc::new(ingestor)), store)
    }

    #[tokio::test(start_paused = true)]
    async fn submitted_task_runs_to_completion() {
        let (manager, store) = manager(MockApi::new().wall(100, 4, 2));

        let task_id = manager.submit(vec![100]);
        let status = manager.wait(task_id).await;

        assert_eq!(status, Some(TaskStatus::Completed));
        assert_eq!(store.counts().comments, 8);

        let view = manager.status(task_id).unwrap();
        assert_eq!(view.status, TaskStatus::Completed);
        assert_eq!(view.progress.processed, 12);
        assert_eq!(view.progress.total, 12);
        assert!((view.progress.percentage - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_a_running_task() {
        let (manager, _) = manager(
            MockApi::new()
                .wall(100, 20, 5)
                .slow(100, Duration::from_millis(200)),
        );

        let task_id = manager.submit(vec![100]);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            manager.status(task_id).map(|v| v.status),
            Some(TaskStatus::Running)
        );

        assert!(manager.cancel(task_id));
        assert_eq!(manager.wait(task_id).await, Some(TaskStatus::Cancelled));

        let view = manager.status(task_id).unwrap();
        assert!(view.progress.processed < view.progress.total);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_task_is_reported_as_missing() {
        let (manager, _) = manager(MockApi::new());
        let task_id = TaskId::new();

        assert!(!manager.cancel(task_id));
        assert!(manager.status(task_id).is_none());
        assert!(manager.wait(task_id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_stops_every_task() {
        let (manager, _) = manager(
            MockApi::new()
                .wall(100, 10, 3)
                .wall(200, 10, 3)
                .slow(100, Duration::from_millis(100))
                .slow(200, Duration::from_millis(100)),
        );

        let first = manager.submit(vec![100]);
        let second = manager.submit(vec![200]);
        tokio::time::sleep(Duration::from_millis(250)).await;
        manager.cancel_all();

        assert_eq!(manager.wait(first).await, Some(TaskStatus::Cancelled));
        assert_eq!(manager.wait(second).await, Some(TaskStatus::Cancelled));
        assert_eq!(manager.list().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_tasks_can_be_pruned() {
        let (manager, _) = manager(
            MockApi::new()
                .wall(100, 1, 0)
                .wall(200, 10, 3)
                .slow(200, Duration::from_millis(100)),
        );

        let done = manager.submit(vec![100]);
        assert_eq!(manager.wait(done).await, Some(TaskStatus::Completed));
        let running = manager.submit(vec![200]);
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(manager.remove(running).is_none());
        assert_eq!(manager.prune_finished(), 1);
        assert!(manager.status(done).is_none());
        assert!(manager.wait(done).await.is_none());
        assert!(!manager.cancel(done));

        assert_eq!(manager.list().len(), 1);
        assert_eq!(manager.wait(running).await, Some(TaskStatus::Completed));
        let task = manager.remove(running).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(manager.list().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_twice_returns_recorded_status() {
        let (manager, _) = manager(MockApi::new().wall(100, 1, 0));

        let task_id = manager.submit(vec![100]);
        assert_eq!(manager.wait(task_id).await, Some(TaskStatus::Completed));
        assert_eq!(manager.wait(task_id).await, Some(TaskStatus::Completed));
    }
}
