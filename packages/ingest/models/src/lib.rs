#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Ingestion task state, the polled status view, and configuration.

pub mod config;
pub mod progress;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use uuid::Uuid;

pub use config::IngestConfig;

/// Opaque identifier of an ingestion task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a task.
///
/// Transitions only move forward:
/// `Pending -> Running -> {Completed | Failed | Cancelled}`. A pending task
/// may also go straight to a terminal state (e.g. cancelled before it
/// started).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether no further mutation is allowed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed | Self::Cancelled => 2,
        }
    }

    /// Whether moving from `self` to `next` goes forward.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        next.rank() > self.rank()
    }
}

/// Work units resolved so far against the currently known total.
///
/// A unit is one post or one comment. `total` grows as pagination discovers
/// posts and their announced comment counts; it never drops below
/// `processed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub processed: u64,
    pub total: u64,
}

impl TaskProgress {
    /// Completion in percent, `0.0` while nothing is known.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.processed as f64 / self.total as f64 * 100.0).min(100.0)
        }
    }
}

/// Per-phase tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseCounters {
    /// Posts yielded by pagination.
    pub posts_found: u64,
    /// Posts persisted.
    pub posts_saved: u64,
    /// Posts whose comments have all been handled, including posts whose
    /// comments turned out to be inaccessible.
    pub posts_completed: u64,
    /// Comments yielded by pagination.
    pub comments_found: u64,
    /// Comments persisted.
    pub comments_saved: u64,
    /// Errors recorded, including ones dropped from the error list.
    pub errors: u64,
}

/// One recorded error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    pub occurred_at: DateTime<Utc>,
    /// Group being processed when the error occurred.
    pub group_id: Option<i64>,
    /// Post being processed when the error occurred.
    pub post_id: Option<i64>,
    pub message: String,
}

impl TaskError {
    /// An error not tied to a group.
    #[must_use]
    pub fn task(message: impl Into<String>) -> Self {
        Self {
            occurred_at: Utc::now(),
            group_id: None,
            post_id: None,
            message: message.into(),
        }
    }

    /// An error while processing `group_id`.
    #[must_use]
    pub fn group(group_id: i64, message: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id),
            ..Self::task(message)
        }
    }

    /// An error while processing `post_id` of `group_id`.
    #[must_use]
    pub fn post(group_id: i64, post_id: i64, message: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id),
            post_id: Some(post_id),
            ..Self::task(message)
        }
    }
}

/// How processing of one group ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupOutcome {
    /// Not reached yet.
    Pending,
    /// Every post and comment was fetched.
    Completed {
        posts: u64,
        comments: u64,
    },
    /// The token has no access to this group.
    Skipped {
        reason: String,
    },
    /// An unrecoverable fetch error or timeout aborted the group.
    Failed {
        reason: String,
    },
    /// The task was cancelled before or while processing this group.
    Cancelled,
}

impl GroupOutcome {
    /// Whether this group counts against the task's final status.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Outcome of one group within a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupResult {
    pub group_id: i64,
    #[serde(flatten)]
    pub outcome: GroupOutcome,
}

/// One ingestion run over one or more VK groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchTask {
    pub task_id: TaskId,
    /// Groups to ingest, in processing order.
    pub group_ids: Vec<i64>,
    pub status: TaskStatus,
    pub progress: TaskProgress,
    pub counters: PhaseCounters,
    /// Per-group outcomes, parallel to `group_ids`.
    pub groups: Vec<GroupResult>,
    /// Errors in the order they were recorded, capped; see `errors_truncated`.
    pub errors: Vec<TaskError>,
    /// Errors dropped after the list reached its cap.
    pub errors_truncated: u64,
    pub last_error: Option<String>,
    /// Human-readable outcome written when the task finishes.
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl FetchTask {
    /// A pending task for the given groups.
    #[must_use]
    pub fn new(group_ids: Vec<i64>) -> Self {
        let groups = group_ids
            .iter()
            .map(|&group_id| GroupResult {
                group_id,
                outcome: GroupOutcome::Pending,
            })
            .collect();

        Self {
            task_id: TaskId::new(),
            group_ids,
            status: TaskStatus::Pending,
            progress: TaskProgress::default(),
            counters: PhaseCounters::default(),
            groups,
            errors: Vec::new(),
            errors_truncated: 0,
            last_error: None,
            summary: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// The read model served to status pollers.
    #[must_use]
    pub fn status_view(&self) -> TaskStatusView {
        TaskStatusView {
            task_id: self.task_id,
            status: self.status,
            progress: ProgressView {
                processed: self.progress.processed,
                total: self.progress.total,
                percentage: self.progress.percentage(),
            },
            errors: self.errors.clone(),
            errors_truncated: self.errors_truncated,
            counters: self.counters,
            groups: self.groups.clone(),
            summary: self.summary.clone(),
        }
    }
}

/// Progress as exposed to status pollers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressView {
    pub processed: u64,
    pub total: u64,
    pub percentage: f64,
}

/// `GET` task status payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress: ProgressView,
    pub errors: Vec<TaskError>,
    pub errors_truncated: u64,
    pub counters: PhaseCounters,
    pub groups: Vec<GroupResult>,
    pub summary: Option<String>,
}
