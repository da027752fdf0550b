#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! VK records and the paginated page envelope.
//!
//! Field names follow the VK API JSON objects returned by `groups.getById`,
//! `wall.get`, and `wall.getComments`, so responses deserialize directly
//! into these types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A record with a stable VK identifier.
///
/// Used by the pagination driver to drop items that reappear on a later
/// page when the upstream list shifts between requests.
pub trait Identified {
    /// The VK identifier of this record, unique within one listing.
    fn vk_id(&self) -> i64;
}

/// A nested `{ "count": n }` object as VK returns for likes, reposts,
/// comments, and views.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    /// The reported count.
    #[serde(default)]
    pub count: u64,
}

/// A VK community (group, public page, or event).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Positive group identifier.
    pub id: i64,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Short address (e.g. `"apiclub"`).
    #[serde(default)]
    pub screen_name: Option<String>,
    /// `0` open, `1` closed, `2` private.
    #[serde(default)]
    pub is_closed: u8,
    /// `"group"`, `"page"`, or `"event"`.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// Member count, when requested via `fields=members_count`.
    #[serde(default)]
    pub members_count: Option<u64>,
}

impl Group {
    /// The wall owner id for this group. Community walls are addressed
    /// with a negative owner id.
    #[must_use]
    pub const fn owner_id(&self) -> i64 {
        -self.id
    }
}

impl Identified for Group {
    fn vk_id(&self) -> i64 {
        self.id
    }
}

/// A wall post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Post identifier, unique per wall.
    pub id: i64,
    /// Wall owner (negative for communities).
    pub owner_id: i64,
    /// Author of the post.
    #[serde(default)]
    pub from_id: i64,
    /// Publication time.
    #[serde(with = "chrono::serde::ts_seconds")]
    pub date: DateTime<Utc>,
    /// Post body.
    #[serde(default)]
    pub text: String,
    /// Comment counter announced by the wall listing.
    #[serde(default)]
    pub comments: Counter,
    #[serde(default)]
    pub likes: Counter,
    #[serde(default)]
    pub reposts: Counter,
    #[serde(default)]
    pub views: Option<Counter>,
    /// `1` when the post is pinned to the top of the wall.
    #[serde(default)]
    pub is_pinned: Option<u8>,
}

impl Post {
    /// Number of comments VK reports for this post.
    #[must_use]
    pub const fn comments_count(&self) -> u64 {
        self.comments.count
    }
}

impl Identified for Post {
    fn vk_id(&self) -> i64 {
        self.id
    }
}

/// A comment on a wall post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    /// Comment identifier, unique per wall.
    pub id: i64,
    /// Wall owner (negative for communities).
    #[serde(default)]
    pub owner_id: i64,
    /// The post this comment belongs to.
    #[serde(default)]
    pub post_id: i64,
    /// Author. Zero for deleted comments.
    #[serde(default)]
    pub from_id: i64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub text: String,
    /// Comment this one replies to, if any.
    #[serde(default)]
    pub reply_to_comment: Option<i64>,
    /// Set on comments that were deleted but still occupy a slot.
    #[serde(default)]
    pub deleted: bool,
    /// Replies to a top-level comment, as returned inline by
    /// `wall.getComments` with `thread_items_count`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<CommentThread>,
}

/// The reply thread under a top-level comment.
///
/// `items` holds at most the first few replies VK sends inline; `count` is
/// the full thread size. When `count` is larger the rest must be paged
/// with `wall.getComments` and `comment_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentThread {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub items: Vec<Comment>,
}

impl CommentThread {
    /// Whether every reply was delivered inline.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.items.len() as u64 >= self.count
    }
}

impl Identified for Comment {
    fn vk_id(&self) -> i64 {
        self.id
    }
}

/// One page of a VK list endpoint.
///
/// `offset` and `requested` are the cursor the page was fetched with;
/// `total` is the list size VK reported alongside the items, when present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    /// Items on this page, in API order.
    pub items: Vec<T>,
    /// Total list size reported by the API.
    pub total: Option<u64>,
    /// Offset the page was requested at.
    pub offset: u64,
    /// Number of items that were requested.
    pub requested: u64,
}

impl<T> Page<T> {
    /// Creates a page fetched with the given cursor.
    #[must_use]
    pub const fn new(items: Vec<T>, total: Option<u64>, offset: u64, requested: u64) -> Self {
        Self {
            items,
            total,
            offset,
            requested,
        }
    }

    /// Offset of the page that follows this one.
    #[must_use]
    pub const fn next_offset(&self) -> u64 {
        self.offset + self.requested
    }

    /// Whether another page should be requested.
    ///
    /// A page shorter than requested marks the end of the list. When the
    /// API reported a total, reaching it also ends the list.
    #[must_use]
    pub fn has_more(&self) -> bool {
        let len = self.items.len() as u64;
        if len < self.requested || len == 0 {
            return false;
        }
        self.total.is_none_or(|total| self.offset + len < total)
    }
}
