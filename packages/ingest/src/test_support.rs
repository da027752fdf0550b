//! Scripted [`VkApi`] and store doubles shared by the orchestrator and
//! task manager tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use vk_ingest_database::memory::MemoryStore;
use vk_ingest_database::{RecordStore, SaveOutcome, StorageError};
use vk_ingest_models::IngestConfig;
use vk_ingest_source::rate_limit::RateLimiter;
use vk_ingest_source::{FetchError, VkApi};
use vk_ingest_source_models::{Comment, CommentThread, Counter, Group, Page, Post};

use crate::Ingestor;
use crate::tracker::TaskTracker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Group(i64),
    Posts { owner_id: i64, offset: u64 },
    Comments {
        owner_id: i64,
        post_id: i64,
        offset: u64,
    },
    Replies {
        post_id: i64,
        comment_id: i64,
        offset: u64,
    },
}

/// Replies the mock returns inline under a top-level comment.
const INLINE_REPLIES: usize = 2;

#[derive(Default)]
pub struct MockApi {
    walls: BTreeMap<i64, Vec<Post>>,
    comments: BTreeMap<(i64, i64), Vec<Comment>>,
    threads: BTreeMap<(i64, i64), Vec<Comment>>,
    group_errors: BTreeMap<i64, FetchError>,
    wall_errors: BTreeMap<i64, FetchError>,
    comment_errors: BTreeMap<(i64, i64), FetchError>,
    latency: BTreeMap<i64, Duration>,
    cancel_during: Mutex<Option<(i64, CancellationToken)>>,
    calls: Mutex<Vec<Call>>,
}

pub fn post(owner_id: i64, id: i64, comments: u64) -> Post {
    Post {
        id,
        owner_id,
        from_id: owner_id,
        date: Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap(),
        text: format!("post {id}"),
        comments: Counter { count: comments },
        likes: Counter::default(),
        reposts: Counter::default(),
        views: None,
        is_pinned: None,
    }
}

pub fn comment(owner_id: i64, post_id: i64, id: i64) -> Comment {
    Comment {
        id,
        owner_id,
        post_id,
        from_id: 1,
        date: Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap(),
        text: format!("comment {id}"),
        reply_to_comment: None,
        deleted: false,
        thread: None,
    }
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group `group_id` with posts `1..=posts`, each carrying
    /// `comments_per_post` comments with ids `post * 1000 + n`.
    pub fn wall(mut self, group_id: i64, posts: i64, comments_per_post: i64) -> Self {
        let owner_id = -group_id;
        let wall = (1..=posts)
            .map(|id| {
                let comments = (1..=comments_per_post)
                    .map(|n| comment(owner_id, id, id * 1000 + n))
                    .collect();
                self.comments.insert((owner_id, id), comments);
                post(owner_id, id, comments_per_post.unsigned_abs())
            })
            .collect();
        self.walls.insert(owner_id, wall);
        self
    }

    /// `replies` replies under comment `comment_id` of post `post_id`, with
    /// ids `comment_id * 100 + n`. The post's announced comment count grows
    /// to include them.
    pub fn thread(mut self, group_id: i64, post_id: i64, comment_id: i64, replies: i64) -> Self {
        let owner_id = -group_id;
        let thread = (1..=replies)
            .map(|n| Comment {
                reply_to_comment: Some(comment_id),
                ..comment(owner_id, post_id, comment_id * 100 + n)
            })
            .collect();
        self.threads.insert((owner_id, comment_id), thread);
        if let Some(post) = self
            .walls
            .get_mut(&owner_id)
            .and_then(|wall| wall.iter_mut().find(|post| post.id == post_id))
        {
            post.comments.count += replies.unsigned_abs();
        }
        self
    }

    pub fn reply_calls_for(&self, comment_id: i64) -> usize {
        self.calls()
            .iter()
            .filter(|call| {
                matches!(call, Call::Replies { comment_id: c, .. } if *c == comment_id)
            })
            .count()
    }

    pub fn fail_group(mut self, group_id: i64, error: FetchError) -> Self {
        self.group_errors.insert(group_id, error);
        self
    }

    pub fn fail_wall(mut self, group_id: i64, error: FetchError) -> Self {
        self.wall_errors.insert(-group_id, error);
        self
    }

    pub fn fail_comments(mut self, group_id: i64, post_id: i64, error: FetchError) -> Self {
        self.comment_errors.insert((-group_id, post_id), error);
        self
    }

    /// Every call for `group_id` takes `delay` to answer.
    pub fn slow(mut self, group_id: i64, delay: Duration) -> Self {
        self.latency.insert(-group_id, delay);
        self
    }

    /// Fires `token` while the first comments page of `post_id` is in
    /// flight.
    pub fn cancel_during_comments(self, post_id: i64, token: CancellationToken) -> Self {
        *self.cancel_during.lock().unwrap() = Some((post_id, token));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn comment_calls_for(&self, post_id: i64) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Comments { post_id: p, .. } if *p == post_id))
            .count()
    }

    pub fn groups_called(&self) -> BTreeSet<i64> {
        self.calls()
            .iter()
            .filter_map(|call| match call {
                Call::Group(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    async fn answer(&self, owner_id: i64, call: Call) {
        self.calls.lock().unwrap().push(call);
        if let Some(delay) = self.latency.get(&owner_id) {
            tokio::time::sleep(*delay).await;
        }
    }
}

fn page<T: Clone>(items: &[T], offset: u64, count: u64) -> Page<T> {
    let start = usize::try_from(offset).unwrap().min(items.len());
    let end = (start + usize::try_from(count).unwrap()).min(items.len());
    Page::new(
        items[start..end].to_vec(),
        Some(items.len() as u64),
        offset,
        count,
    )
}

#[async_trait]
impl VkApi for MockApi {
    async fn get_group(&self, group_id: i64) -> Result<Group, FetchError> {
        self.answer(-group_id, Call::Group(group_id)).await;
        if let Some(error) = self.group_errors.get(&group_id) {
            return Err(error.clone());
        }
        Ok(Group {
            id: group_id,
            name: format!("group {group_id}"),
            screen_name: Some(format!("club{group_id}")),
            is_closed: 0,
            kind: Some("group".to_owned()),
            members_count: Some(10),
        })
    }

    async fn get_posts(
        &self,
        owner_id: i64,
        offset: u64,
        count: u64,
    ) -> Result<Page<Post>, FetchError> {
        self.answer(owner_id, Call::Posts { owner_id, offset }).await;
        if let Some(error) = self.wall_errors.get(&owner_id) {
            return Err(error.clone());
        }
        let wall = self.walls.get(&owner_id).cloned().unwrap_or_default();
        Ok(page(&wall, offset, count))
    }

    async fn get_comments(
        &self,
        owner_id: i64,
        post_id: i64,
        offset: u64,
        count: u64,
    ) -> Result<Page<Comment>, FetchError> {
        self.answer(
            owner_id,
            Call::Comments {
                owner_id,
                post_id,
                offset,
            },
        )
        .await;

        let fire = self
            .cancel_during
            .lock()
            .unwrap()
            .as_ref()
            .filter(|(cancel_post, _)| *cancel_post == post_id && offset == 0)
            .map(|(_, token)| token.clone());
        if let Some(token) = fire {
            token.cancel();
        }

        if let Some(error) = self.comment_errors.get(&(owner_id, post_id)) {
            return Err(error.clone());
        }
        let comments = self
            .comments
            .get(&(owner_id, post_id))
            .cloned()
            .unwrap_or_default();
        let mut result = page(&comments, offset, count);
        for comment in &mut result.items {
            if let Some(replies) = self.threads.get(&(owner_id, comment.id)) {
                comment.thread = Some(CommentThread {
                    count: replies.len() as u64,
                    items: replies.iter().take(INLINE_REPLIES).cloned().collect(),
                });
            }
        }
        Ok(result)
    }

    async fn get_replies(
        &self,
        owner_id: i64,
        post_id: i64,
        comment_id: i64,
        offset: u64,
        count: u64,
    ) -> Result<Page<Comment>, FetchError> {
        self.answer(
            owner_id,
            Call::Replies {
                post_id,
                comment_id,
                offset,
            },
        )
        .await;

        let replies = self
            .threads
            .get(&(owner_id, comment_id))
            .cloned()
            .unwrap_or_default();
        Ok(page(&replies, offset, count))
    }
}

/// [`MemoryStore`] that refuses the listed comment ids.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub reject_comments: BTreeSet<i64>,
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn save_group(&self, group: &Group) -> Result<SaveOutcome, StorageError> {
        self.inner.save_group(group).await
    }

    async fn save_post(&self, post: &Post) -> Result<SaveOutcome, StorageError> {
        self.inner.save_post(post).await
    }

    async fn save_comment(&self, comment: &Comment) -> Result<SaveOutcome, StorageError> {
        if self.reject_comments.contains(&comment.id) {
            return Err(StorageError::Unavailable {
                message: format!("disk full writing comment {}", comment.id),
            });
        }
        self.inner.save_comment(comment).await
    }
}

/// Config with small pages so pagination is exercised.
pub fn test_config() -> IngestConfig {
    IngestConfig {
        posts_page_size: 5,
        comments_page_size: 2,
        comment_workers: 2,
        ..IngestConfig::default()
    }
}

pub fn ingestor(
    api: Arc<dyn VkApi>,
    store: Arc<dyn RecordStore>,
    config: IngestConfig,
) -> Ingestor {
    Ingestor::new(
        api,
        store,
        Arc::new(RateLimiter::new(1_000, 1_000)),
        Arc::new(TaskTracker::default()),
        config,
    )
}
