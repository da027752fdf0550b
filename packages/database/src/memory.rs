//! In-process [`RecordStore`] keyed by VK identity.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use vk_ingest_source_models::{Comment, Group, Post};

use crate::{RecordStore, SaveOutcome, StorageError};

#[derive(Debug, Default)]
struct Records {
    groups: BTreeMap<i64, Group>,
    posts: BTreeMap<(i64, i64), Post>,
    comments: BTreeMap<(i64, i64), Comment>,
}

/// Row counts held by a [`MemoryStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordCounts {
    pub groups: usize,
    pub posts: usize,
    pub comments: usize,
}

/// Everything a [`MemoryStore`] holds, in identity order.
#[derive(Debug, Clone, Serialize)]
pub struct RecordSnapshot {
    pub groups: Vec<Group>,
    pub posts: Vec<Post>,
    pub comments: Vec<Comment>,
}

/// Upserting store backed by ordered maps.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
}

fn upsert<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, value: V) -> SaveOutcome {
    match map.entry(key) {
        Entry::Vacant(entry) => {
            entry.insert(value);
            SaveOutcome::Inserted
        }
        Entry::Occupied(mut entry) => {
            entry.insert(value);
            SaveOutcome::Updated
        }
    }
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_records<R>(&self, f: impl FnOnce(&mut Records) -> R) -> R {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut records)
    }

    /// Current row counts.
    #[must_use]
    pub fn counts(&self) -> RecordCounts {
        self.with_records(|r| RecordCounts {
            groups: r.groups.len(),
            posts: r.posts.len(),
            comments: r.comments.len(),
        })
    }

    /// Comments stored for one post, in id order.
    #[must_use]
    pub fn comments_for(&self, owner_id: i64, post_id: i64) -> Vec<Comment> {
        self.with_records(|r| {
            r.comments
                .values()
                .filter(|c| c.owner_id == owner_id && c.post_id == post_id)
                .cloned()
                .collect()
        })
    }

    /// Posts stored for one wall, in id order.
    #[must_use]
    pub fn posts_for(&self, owner_id: i64) -> Vec<Post> {
        self.with_records(|r| {
            r.posts
                .range((owner_id, i64::MIN)..=(owner_id, i64::MAX))
                .map(|(_, post)| post.clone())
                .collect()
        })
    }

    /// Copies out every stored record.
    #[must_use]
    pub fn snapshot(&self) -> RecordSnapshot {
        self.with_records(|r| RecordSnapshot {
            groups: r.groups.values().cloned().collect(),
            posts: r.posts.values().cloned().collect(),
            comments: r.comments.values().cloned().collect(),
        })
    }

    /// Pretty-printed JSON of [`Self::snapshot`].
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Json`] if serialization fails.
    pub fn export_json(&self) -> Result<String, StorageError> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn save_group(&self, group: &Group) -> Result<SaveOutcome, StorageError> {
        Ok(self.with_records(|r| upsert(&mut r.groups, group.id, group.clone())))
    }

    async fn save_post(&self, post: &Post) -> Result<SaveOutcome, StorageError> {
        Ok(self.with_records(|r| upsert(&mut r.posts, (post.owner_id, post.id), post.clone())))
    }

    async fn save_comment(&self, comment: &Comment) -> Result<SaveOutcome, StorageError> {
        if comment.owner_id == 0 || comment.post_id == 0 {
            log::warn!(
                "Rejecting comment {} without owner/post (owner_id={}, post_id={})",
                comment.id,
                comment.owner_id,
                comment.post_id
            );
            return Err(StorageError::Rejected {
                message: format!("comment {} has no owner or post id", comment.id),
            });
        }
        Ok(self.with_records(|r| {
            upsert(
                &mut r.comments,
                (comment.owner_id, comment.id),
                comment.clone(),
            )
        }))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use vk_ingest_source_models::Counter;

    use super::*;

    fn post(owner_id: i64, id: i64, text: &str) -> Post {
        Post {
            id,
            owner_id,
            from_id: owner_id,
            date: Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap(),
            text: text.to_owned(),
            comments: Counter::default(),
            likes: Counter::default(),
            reposts: Counter::default(),
            views: None,
            is_pinned: None,
        }
    }

    fn comment(owner_id: i64, post_id: i64, id: i64) -> Comment {
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

    #[tokio::test]
    async fn saving_same_post_twice_updates_in_place() {
        let store = MemoryStore::new();

        assert_eq!(
            store.save_post(&post(-100, 1, "first")).await.unwrap(),
            SaveOutcome::Inserted
        );
        assert_eq!(
            store.save_post(&post(-100, 1, "edited")).await.unwrap(),
            SaveOutcome::Updated
        );

        assert_eq!(store.counts().posts, 1);
        assert_eq!(store.posts_for(-100)[0].text, "edited");
    }

    #[tokio::test]
    async fn same_post_id_on_different_walls_are_distinct() {
        let store = MemoryStore::new();
        store.save_post(&post(-100, 1, "a")).await.unwrap();
        store.save_post(&post(-200, 1, "b")).await.unwrap();

        assert_eq!(store.counts().posts, 2);
        assert_eq!(store.posts_for(-200).len(), 1);
    }

    #[tokio::test]
    async fn rejects_comment_without_post() {
        let store = MemoryStore::new();
        let result = store.save_comment(&comment(-100, 0, 7)).await;

        assert!(matches!(result, Err(StorageError::Rejected { .. })));
        assert_eq!(store.counts().comments, 0);
    }

    #[tokio::test]
    async fn exports_all_records_as_json() {
        let store = MemoryStore::new();
        store.save_post(&post(-100, 1, "a")).await.unwrap();
        store.save_comment(&comment(-100, 1, 10)).await.unwrap();
        store.save_comment(&comment(-100, 1, 11)).await.unwrap();

        let json: serde_json::Value = serde_json::from_str(&store.export_json().unwrap()).unwrap();
        assert_eq!(json["posts"].as_array().unwrap().len(), 1);
        assert_eq!(json["comments"].as_array().unwrap().len(), 2);
        assert_eq!(store.comments_for(-100, 1).len(), 2);
    }
}
