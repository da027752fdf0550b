#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! VK API access for the ingestion worker.
//!
//! The [`VkApi`] trait is the boundary to the VK REST API: each call
//! performs exactly one HTTP request. Admission control lives in
//! [`rate_limit`], bounded retry with backoff in [`retry`], and the
//! offset-driven page walk in [`paginate`]. [`client::VkClient`] is the
//! `reqwest` implementation of [`VkApi`].

pub mod client;
pub mod paginate;
pub mod rate_limit;
pub mod retry;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use vk_ingest_source_models::{Comment, Group, Page, Post};

/// Errors that can occur while fetching from the VK API.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// VK error 6 or HTTP 429.
    #[error("Rate limited by VK")]
    RateLimited,

    /// The access token is invalid or expired (VK error 5).
    #[error("Authentication failed: {message}")]
    Authentication {
        /// Message reported by VK.
        message: String,
    },

    /// The token may not read this group or post (VK errors 15, 18, 30,
    /// 203, 212).
    #[error("Access denied: {message}")]
    AccessDenied {
        /// Message reported by VK.
        message: String,
    },

    /// VK demands a captcha for this token (VK error 14).
    #[error("Captcha required: {message}")]
    Captcha {
        /// Message reported by VK.
        message: String,
    },

    /// Connection failure, timeout, HTTP 5xx, or a VK internal error.
    #[error("Transient error: {message}")]
    Transient {
        /// Description of what went wrong.
        message: String,
    },

    /// Non-retryable HTTP status.
    #[error("HTTP {status}: {body}")]
    Http {
        /// Response status code.
        status: u16,
        /// Preview of the response body.
        body: String,
    },

    /// VK error code without a dedicated variant.
    #[error("VK API error {code}: {message}")]
    Api {
        /// VK `error_code`.
        code: i64,
        /// VK `error_msg`.
        message: String,
    },

    /// A retryable error persisted through every allowed attempt.
    #[error("Gave up after {attempts} attempts: {last}")]
    MaxRetriesExceeded {
        /// Number of requests made.
        attempts: u32,
        /// The error returned by the final attempt.
        last: Box<Self>,
    },

    /// Work for a group did not finish within its time budget.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the operation.
    #[error("Cancelled")]
    Cancelled,

    /// The response body was not the JSON shape VK documents.
    #[error("Failed to decode response: {message}")]
    Decode {
        /// Description of what went wrong.
        message: String,
    },
}

impl FetchError {
    /// Maps a VK `error_code` to its error variant.
    #[must_use]
    pub fn from_vk_code(code: i64, message: String) -> Self {
        match code {
            6 => Self::RateLimited,
            5 => Self::Authentication { message },
            14 => Self::Captcha { message },
            15 | 18 | 30 | 203 | 212 => Self::AccessDenied { message },
            1 | 10 => Self::Transient { message },
            _ => Self::Api { code, message },
        }
    }

    /// Whether the retry executor should try the request again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Transient { .. })
    }

    /// Whether every later call made with the same token would fail the
    /// same way, so the whole task must stop.
    #[must_use]
    pub const fn is_task_fatal(&self) -> bool {
        matches!(self, Self::Authentication { .. } | Self::Captcha { .. })
    }

    /// Whether the token lacks access to the requested group or post.
    #[must_use]
    pub const fn is_access_denied(&self) -> bool {
        matches!(self, Self::AccessDenied { .. })
    }

    /// Whether this error is a cancellation rather than a failure.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<rate_limit::Cancelled> for FetchError {
    fn from(_: rate_limit::Cancelled) -> Self {
        Self::Cancelled
    }
}

/// A VK access token.
///
/// `Debug` and `Display` never print the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wraps a raw token string.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for the request query string only.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// The VK endpoints the ingestion worker consumes.
///
/// Implementations perform exactly one request per call and surface VK
/// error codes through [`FetchError`]. Rate limiting and retry are the
/// caller's concern.
#[async_trait]
pub trait VkApi: Send + Sync {
    /// `groups.getById` for a single group.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] if the request fails or VK reports an error.
    async fn get_group(&self, group_id: i64) -> Result<Group, FetchError>;

    /// One page of `wall.get` for the given wall owner.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] if the request fails or VK reports an error.
    async fn get_posts(&self, owner_id: i64, offset: u64, count: u64)
    -> Result<Page<Post>, FetchError>;

    /// One page of `wall.getComments` for a post.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] if the request fails or VK reports an error.
    async fn get_comments(
        &self,
        owner_id: i64,
        post_id: i64,
        offset: u64,
        count: u64,
    ) -> Result<Page<Comment>, FetchError>;

    /// One page of the reply thread under top-level comment `comment_id`
    /// (`wall.getComments` with `comment_id`).
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] if the request fails or VK reports an error.
    async fn get_replies(
        &self,
        owner_id: i64,
        post_id: i64,
        comment_id: i64,
        offset: u64,
        count: u64,
    ) -> Result<Page<Comment>, FetchError>;
}
