#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Ingestion worker that pulls VK group walls and their comments into a
//! [`RecordStore`].
//!
//! [`Ingestor::run`] drives one task: groups are processed in order, posts
//! are paged and persisted as they arrive, and the comments of up to
//! `comment_workers` posts are fetched concurrently. Every VK request goes
//! through the shared [`RetryExecutor`] and therefore the shared
//! [`RateLimiter`]. [`manager::TaskManager`] spawns runs and exposes status
//! and cancellation to callers.

pub mod config;
pub mod manager;
pub mod tracker;

#[cfg(test)]
mod test_support;

use std::pin::pin;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use vk_ingest_database::RecordStore;
use vk_ingest_models::{GroupOutcome, IngestConfig, TaskError, TaskId, TaskStatus};
use vk_ingest_source::paginate::fetch_all;
use vk_ingest_source::rate_limit::RateLimiter;
use vk_ingest_source::retry::{RetryExecutor, RetryPolicy};
use vk_ingest_source::{FetchError, VkApi};
use vk_ingest_source_models::{Comment, Page, Post};

use crate::tracker::{ProgressDelta, TaskTracker};

/// Builds the process-wide rate limiter described by `config`.
#[must_use]
pub fn rate_limiter(config: &IngestConfig) -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(config.requests_per_second, config.burst))
}

/// Retry policy described by `config`.
#[must_use]
pub fn retry_policy(config: &IngestConfig) -> RetryPolicy {
    RetryPolicy {
        max_retries: config.max_retries,
        backoff_base: config.backoff_base(),
        max_backoff: config.max_backoff(),
    }
}

/// Records fetched for one group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct GroupStats {
    posts: u64,
    comments: u64,
}

/// Runs ingestion tasks against a VK API and a record store.
pub struct Ingestor {
    api: Arc<dyn VkApi>,
    store: Arc<dyn RecordStore>,
    executor: RetryExecutor,
    tracker: Arc<TaskTracker>,
    config: IngestConfig,
}

impl Ingestor {
    /// Creates an ingestor. `limiter` should be shared by every ingestor
    /// that uses the same access token.
    #[must_use]
    pub fn new(
        api: Arc<dyn VkApi>,
        store: Arc<dyn RecordStore>,
        limiter: Arc<RateLimiter>,
        tracker: Arc<TaskTracker>,
        config: IngestConfig,
    ) -> Self {
        let executor = RetryExecutor::new(limiter, retry_policy(&config));
        Self {
            api,
            store,
            executor,
            tracker,
            config,
        }
    }

    /// Task state shared with status readers.
    #[must_use]
    pub const fn tracker(&self) -> &Arc<TaskTracker> {
        &self.tracker
    }

    /// Processes every group of `task_id` and returns the final status.
    ///
    /// Never returns an error: failures are recorded on the task. A task
    /// that is not pending (e.g. cancelled before it started) is left as
    /// it is.
    pub async fn run(&self, task_id: TaskId, cancel: CancellationToken) -> TaskStatus {
        let Some(task) = self.tracker.snapshot(task_id) else {
            log::error!("[task {task_id}] cannot run: unknown task");
            return TaskStatus::Failed;
        };

        if cancel.is_cancelled() {
            self.tracker.cancel_pending(task_id);
            return self.tracker.status(task_id).unwrap_or(TaskStatus::Cancelled);
        }
        if !self.tracker.transition(task_id, TaskStatus::Running) {
            return self.tracker.status(task_id).unwrap_or(task.status);
        }

        let start = Instant::now();
        let group_count = task.group_ids.len();
        let mut fatal = None;
        let mut cancelled = false;

        for (index, &group_id) in task.group_ids.iter().enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            self.tracker.group_started(task_id, group_id, index + 1, group_count);

            match self.sync_group_with_timeout(task_id, group_id, &cancel).await {
                Ok(stats) => {
                    log::info!(
                        "[task {task_id}] group {group_id}: {} posts, {} comments",
                        stats.posts,
                        stats.comments
                    );
                    self.tracker.set_group_outcome(
                        task_id,
                        group_id,
                        GroupOutcome::Completed {
                            posts: stats.posts,
                            comments: stats.comments,
                        },
                    );
                }
                Err(e) if e.is_cancelled() => {
                    log::info!("[task {task_id}] cancelled during group {group_id}");
                    cancelled = true;
                    break;
                }
                Err(e) if e.is_access_denied() => {
                    log::warn!("[task {task_id}] skipping group {group_id}: {e}");
                    self.tracker
                        .record_error(task_id, TaskError::group(group_id, e.to_string()));
                    self.tracker.set_group_outcome(
                        task_id,
                        group_id,
                        GroupOutcome::Skipped {
                            reason: e.to_string(),
                        },
                    );
                }
                Err(e) => {
                    log::error!("[task {task_id}] group {group_id} failed: {e}");
                    self.tracker
                        .record_error(task_id, TaskError::group(group_id, e.to_string()));
                    self.tracker.set_group_outcome(
                        task_id,
                        group_id,
                        GroupOutcome::Failed {
                            reason: e.to_string(),
                        },
                    );
                    if e.is_task_fatal() {
                        fatal = Some(e);
                        break;
                    }
                }
            }
        }

        let elapsed = start.elapsed().as_secs_f64();

        if cancelled {
            let summary = format!(
                "Cancelled after {elapsed:.1}s; {}",
                self.outcome_summary(task_id)
            );
            self.tracker.finish(task_id, TaskStatus::Cancelled, summary);
            return self.tracker.status(task_id).unwrap_or(TaskStatus::Cancelled);
        }

        if let Some(e) = fatal {
            self.skip_remaining_groups(task_id, &e);
            let summary = format!("Aborted: {e}; {}", self.outcome_summary(task_id));
            self.tracker.finish(task_id, TaskStatus::Failed, summary);
            return TaskStatus::Failed;
        }

        let any_failed = self
            .tracker
            .snapshot(task_id)
            .is_some_and(|task| task.groups.iter().any(|g| g.outcome.is_failure()));
        let status = if any_failed {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };

        let summary = format!("{} in {elapsed:.1}s", self.outcome_summary(task_id));
        log::info!("[task {task_id}] {status}: {summary}");
        self.tracker.finish(task_id, status, summary);
        status
    }

    async fn sync_group_with_timeout(
        &self,
        task_id: TaskId,
        group_id: i64,
        cancel: &CancellationToken,
    ) -> Result<GroupStats, FetchError> {
        let work = self.sync_group(task_id, group_id, cancel);
        match self.config.group_timeout() {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .unwrap_or(Err(FetchError::Timeout(limit))),
            None => work.await,
        }
    }

    /// Fetches the group, then every post and its comments.
    ///
    /// Stops at the first unrecoverable fetch error. Comment jobs already
    /// running are drained on cancellation so their in-flight page is
    /// persisted.
    async fn sync_group(
        &self,
        task_id: TaskId,
        group_id: i64,
        cancel: &CancellationToken,
    ) -> Result<GroupStats, FetchError> {
        let group = self
            .executor
            .execute(cancel, &format!("group {group_id}"), || {
                self.api.get_group(group_id)
            })
            .await?;

        if let Err(e) = self.store.save_group(&group).await {
            log::warn!("[task {task_id}] failed to save group {group_id}: {e}");
            self.tracker.record_error(
                task_id,
                TaskError::group(group_id, format!("Failed to save group: {e}")),
            );
        }

        let owner_id = group.owner_id();
        let posts = fetch_all(
            format!("wall {owner_id}"),
            |offset, count| self.fetch_posts(cancel, owner_id, offset, count),
            self.config.posts_page_size,
            self.config.max_posts_per_group,
        );
        let mut posts = pin!(posts);

        let workers = self.config.comment_workers.max(1);
        let mut jobs = FuturesUnordered::new();
        let mut stats = GroupStats::default();
        let mut failure = None;

        'posts: loop {
            if cancel.is_cancelled() {
                failure = Some(FetchError::Cancelled);
                break;
            }

            let post = match posts.next().await {
                None => break,
                Some(Ok(post)) => post,
                Some(Err(e)) => {
                    failure = Some(e);
                    break;
                }
            };

            self.save_post(task_id, group_id, &post).await;
            stats.posts += 1;
            jobs.push(self.sync_comments(task_id, group_id, post, cancel));

            while jobs.len() >= workers {
                let Some(result) = jobs.next().await else {
                    break;
                };
                if let Err(e) = self.absorb_comments(task_id, group_id, result, &mut stats) {
                    failure = Some(e);
                    break 'posts;
                }
            }
        }

        if failure.as_ref().is_none_or(FetchError::is_cancelled) {
            while let Some(result) = jobs.next().await {
                if let Err(e) = self.absorb_comments(task_id, group_id, result, &mut stats) {
                    let stop = !e.is_cancelled();
                    if failure.as_ref().is_none_or(FetchError::is_cancelled) {
                        failure = Some(e);
                    }
                    if stop {
                        break;
                    }
                }
            }
        }

        failure.map_or(Ok(stats), Err)
    }

    async fn fetch_posts(
        &self,
        cancel: &CancellationToken,
        owner_id: i64,
        offset: u64,
        count: u64,
    ) -> Result<Page<Post>, FetchError> {
        self.executor
            .execute(cancel, &format!("wall {owner_id} @{offset}"), || {
                self.api.get_posts(owner_id, offset, count)
            })
            .await
    }

    async fn fetch_comments(
        &self,
        cancel: &CancellationToken,
        owner_id: i64,
        post_id: i64,
        offset: u64,
        count: u64,
    ) -> Result<Page<Comment>, FetchError> {
        self.executor
            .execute(
                cancel,
                &format!("comments {owner_id}_{post_id} @{offset}"),
                || self.api.get_comments(owner_id, post_id, offset, count),
            )
            .await
    }

    /// Persists a post and accounts for it and its announced comments.
    async fn save_post(&self, task_id: TaskId, group_id: i64, post: &Post) {
        self.tracker.update_counters(task_id, |c| c.posts_found += 1);
        self.tracker.update_progress(
            task_id,
            ProgressDelta::discovered(1 + post.comments_count()),
        );

        match self.store.save_post(post).await {
            Ok(_) => {
                self.tracker.update_counters(task_id, |c| c.posts_saved += 1);
            }
            Err(e) => {
                log::warn!(
                    "[task {task_id}] failed to save post {}_{}: {e}",
                    post.owner_id,
                    post.id
                );
                self.tracker.record_error(
                    task_id,
                    TaskError::post(group_id, post.id, format!("Failed to save post: {e}")),
                );
            }
        }

        self.tracker.update_progress(task_id, ProgressDelta::processed(1));
    }

    async fn fetch_replies(
        &self,
        cancel: &CancellationToken,
        owner_id: i64,
        post_id: i64,
        comment_id: i64,
        offset: u64,
        count: u64,
    ) -> Result<Page<Comment>, FetchError> {
        self.executor
            .execute(
                cancel,
                &format!("replies {owner_id}_{post_id}/{comment_id} @{offset}"),
                || {
                    self.api
                        .get_replies(owner_id, post_id, comment_id, offset, count)
                },
            )
            .await
    }

    /// Fetches and persists every comment of `post`, thread replies
    /// included.
    ///
    /// Returns the post id with the number of comments saved. Persistence
    /// failures are recorded and skipped.
    async fn sync_comments(
        &self,
        task_id: TaskId,
        group_id: i64,
        post: Post,
        cancel: &CancellationToken,
    ) -> (i64, Result<u64, FetchError>) {
        let announced = post.comments_count();
        let (owner_id, post_id) = (post.owner_id, post.id);

        if announced == 0 {
            self.tracker.update_counters(task_id, |c| c.posts_completed += 1);
            return (post_id, Ok(0));
        }

        let comments = fetch_all(
            format!("comments {owner_id}_{post_id}"),
            |offset, count| self.fetch_comments(cancel, owner_id, post_id, offset, count),
            self.config.comments_page_size,
            self.config.max_comments_per_post,
        );
        let mut comments = pin!(comments);

        let mut resolved = 0u64;
        let mut saved = 0u64;

        while let Some(item) = comments.next().await {
            let mut comment = match item {
                Ok(comment) => comment,
                Err(e) => return self.abandon_comments(task_id, post_id, announced, resolved, e),
            };
            let parent_id = comment.id;
            let thread = comment.thread.take();

            saved += u64::from(self.persist_comment(task_id, group_id, &post, comment).await);
            resolved += 1;

            let Some(thread) = thread else {
                continue;
            };

            if thread.is_complete() {
                for reply in thread.items {
                    saved += u64::from(self.persist_comment(task_id, group_id, &post, reply).await);
                    resolved += 1;
                }
                continue;
            }

            let replies = fetch_all(
                format!("replies {owner_id}_{post_id}/{parent_id}"),
                |offset, count| {
                    self.fetch_replies(cancel, owner_id, post_id, parent_id, offset, count)
                },
                self.config.comments_page_size,
                None,
            );
            let mut replies = pin!(replies);

            while let Some(item) = replies.next().await {
                match item {
                    Ok(reply) => {
                        saved +=
                            u64::from(self.persist_comment(task_id, group_id, &post, reply).await);
                        resolved += 1;
                    }
                    Err(e) => {
                        return self.abandon_comments(task_id, post_id, announced, resolved, e);
                    }
                }
            }
        }

        self.settle_shortfall(task_id, announced, resolved);
        self.tracker.update_counters(task_id, |c| c.posts_completed += 1);
        log::debug!("[task {task_id}] post {owner_id}_{post_id}: {saved}/{announced} comments");

        (post_id, Ok(saved))
    }

    /// Persists one comment or reply of `post` and accounts for it.
    /// Returns whether it was saved.
    async fn persist_comment(
        &self,
        task_id: TaskId,
        group_id: i64,
        post: &Post,
        mut comment: Comment,
    ) -> bool {
        if comment.owner_id == 0 {
            comment.owner_id = post.owner_id;
        }
        if comment.post_id == 0 {
            comment.post_id = post.id;
        }
        comment.thread = None;

        self.tracker.update_counters(task_id, |c| c.comments_found += 1);

        let saved = match self.store.save_comment(&comment).await {
            Ok(_) => {
                self.tracker
                    .update_counters(task_id, |c| c.comments_saved += 1);
                true
            }
            Err(e) => {
                log::warn!(
                    "[task {task_id}] failed to save comment {} on {}_{}: {e}",
                    comment.id,
                    post.owner_id,
                    post.id
                );
                self.tracker.record_error(
                    task_id,
                    TaskError::post(
                        group_id,
                        post.id,
                        format!("Failed to save comment {}: {e}", comment.id),
                    ),
                );
                false
            }
        };

        self.tracker
            .update_progress(task_id, ProgressDelta::processed(1));
        saved
    }

    /// Stops a post's comment job on a fetch error. An access-denied post
    /// is finished here: its undelivered comments are settled and it
    /// counts as completed.
    fn abandon_comments(
        &self,
        task_id: TaskId,
        post_id: i64,
        announced: u64,
        resolved: u64,
        error: FetchError,
    ) -> (i64, Result<u64, FetchError>) {
        if error.is_access_denied() {
            self.settle_shortfall(task_id, announced, resolved);
            self.tracker.update_counters(task_id, |c| c.posts_completed += 1);
        }
        (post_id, Err(error))
    }

    /// Resolves announced comments that were never delivered (deleted
    /// meanwhile, or cut off by `max_comments_per_post`).
    fn settle_shortfall(&self, task_id: TaskId, announced: u64, resolved: u64) {
        if resolved < announced {
            self.tracker
                .update_progress(task_id, ProgressDelta::processed(announced - resolved));
        }
    }

    /// Folds a finished comment job into `stats`. An access-denied post is
    /// recorded and skipped; any other error aborts the group.
    fn absorb_comments(
        &self,
        task_id: TaskId,
        group_id: i64,
        (post_id, result): (i64, Result<u64, FetchError>),
        stats: &mut GroupStats,
    ) -> Result<(), FetchError> {
        match result {
            Ok(saved) => {
                stats.comments += saved;
                Ok(())
            }
            Err(e) if e.is_access_denied() => {
                log::warn!("[task {task_id}] comments of post {post_id} unavailable: {e}");
                self.tracker
                    .record_error(task_id, TaskError::post(group_id, post_id, e.to_string()));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn skip_remaining_groups(&self, task_id: TaskId, cause: &FetchError) {
        let Some(task) = self.tracker.snapshot(task_id) else {
            return;
        };
        for group in task.groups {
            if group.outcome == GroupOutcome::Pending {
                self.tracker.set_group_outcome(
                    task_id,
                    group.group_id,
                    GroupOutcome::Skipped {
                        reason: format!("Task aborted: {cause}"),
                    },
                );
            }
        }
    }

    /// One-line tally of group outcomes and records.
    fn outcome_summary(&self, task_id: TaskId) -> String {
        let Some(task) = self.tracker.snapshot(task_id) else {
            return String::new();
        };

        let (mut completed, mut skipped, mut failed) = (0, 0, 0);
        for group in &task.groups {
            match group.outcome {
                GroupOutcome::Completed { .. } => completed += 1,
                GroupOutcome::Skipped { .. } => skipped += 1,
                GroupOutcome::Failed { .. } => failed += 1,
                GroupOutcome::Pending | GroupOutcome::Cancelled => {}
            }
        }

        format!(
            "{completed}/{} groups completed ({skipped} skipped, {failed} failed), {} posts, {} comments, {} errors",
            task.groups.len(),
            task.counters.posts_saved,
            task.counters.comments_saved,
            task.counters.errors,
        )
    }
}
