//! `reqwest` implementation of [`VkApi`].
//!
//! Each method issues a single `GET {api_url}/method/{name}` request and
//! unwraps VK's `{"response": ...}` / `{"error": ...}` envelope. Retry and
//! rate limiting happen in [`crate::retry`], so a failed call here is
//! reported exactly once.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use vk_ingest_source_models::{Comment, Group, Page, Post};

use crate::{AccessToken, FetchError, VkApi};

/// Public VK API host.
pub const DEFAULT_API_URL: &str = "https://api.vk.com";

/// API version sent with every request.
pub const DEFAULT_API_VERSION: &str = "5.199";

/// Replies VK returns inline under each top-level comment (its maximum).
const THREAD_ITEMS_COUNT: u64 = 10;

/// Maximum length of the response body included in errors.
const BODY_PREVIEW_LEN: usize = 500;

/// VK API client bound to one access token.
pub struct VkClient {
    http: reqwest::Client,
    api_url: String,
    api_version: String,
    token: AccessToken,
}

impl VkClient {
    /// Creates a client for the public API with the default version.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Transient`] if the HTTP client cannot be built.
    pub fn new(token: AccessToken) -> Result<Self, FetchError> {
        Self::with_options(
            token,
            DEFAULT_API_URL,
            DEFAULT_API_VERSION,
            Duration::from_secs(30),
        )
    }

    /// Creates a client against a custom host, API version, and
    /// per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Transient`] if the HTTP client cannot be built.
    pub fn with_options(
        token: AccessToken,
        api_url: &str,
        api_version: &str,
        request_timeout: Duration,
    ) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .user_agent("vk-ingest/1.0")
            .timeout(request_timeout)
            .build()
            .map_err(|e| FetchError::Transient {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_owned(),
            api_version: api_version.to_owned(),
            token,
        })
    }

    async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<R, FetchError> {
        let url = format!("{}/method/{method}", self.api_url);

        let response = self
            .http
            .get(&url)
            .query(params)
            .query(&[
                ("access_token", self.token.expose()),
                ("v", self.api_version.as_str()),
            ])
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_reqwest_error)?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &body));
        }

        decode_envelope(method, &body)
    }
}

#[derive(Deserialize)]
struct Envelope<R> {
    response: Option<R>,
    error: Option<VkErrorBody>,
}

#[derive(Deserialize)]
struct VkErrorBody {
    error_code: i64,
    #[serde(default)]
    error_msg: String,
}

/// `{ "count": n, "items": [...] }` as returned by list methods.
#[derive(Deserialize)]
struct ItemsResponse<T> {
    #[serde(default)]
    count: Option<u64>,
    /// Top-level comment count on `wall.getComments`; `count` there
    /// includes thread replies.
    #[serde(default)]
    current_level_count: Option<u64>,
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

/// `groups.getById` returns a bare array before API 5.139 and an object
/// with a `groups` array after.
#[derive(Deserialize)]
#[serde(untagged)]
enum GroupsResponse {
    Wrapped { groups: Vec<Group> },
    Bare(Vec<Group>),
}

impl GroupsResponse {
    fn into_groups(self) -> Vec<Group> {
        match self {
            Self::Wrapped { groups } | Self::Bare(groups) => groups,
        }
    }
}

/// Maps a transport error. The request URL carries the access token, so
/// it is stripped before the error is rendered.
fn map_reqwest_error(e: reqwest::Error) -> FetchError {
    let e = e.without_url();
    let transient = e.is_timeout() || e.is_connect() || e.is_request() || e.is_body();

    let mut message = e.to_string();
    let mut source = std::error::Error::source(&e);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    if transient {
        FetchError::Transient { message }
    } else {
        FetchError::Decode { message }
    }
}

fn preview(body: &str) -> String {
    if body.len() > BODY_PREVIEW_LEN {
        let mut end = BODY_PREVIEW_LEN;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    } else {
        body.to_owned()
    }
}

/// Maps a non-2xx HTTP status to a fetch error.
fn classify_status(status: u16, body: &str) -> FetchError {
    match status {
        429 => FetchError::RateLimited,
        500..=599 => FetchError::Transient {
            message: format!("HTTP {status}"),
        },
        _ => FetchError::Http {
            status,
            body: preview(body),
        },
    }
}

/// Unwraps a VK response envelope.
fn decode_envelope<R: DeserializeOwned>(method: &str, body: &str) -> Result<R, FetchError> {
    let envelope: Envelope<R> = serde_json::from_str(body).map_err(|e| FetchError::Decode {
        message: format!("{method}: {e} (body: {})", preview(body)),
    })?;

    if let Some(error) = envelope.error {
        return Err(FetchError::from_vk_code(error.error_code, error.error_msg));
    }

    envelope.response.ok_or_else(|| FetchError::Decode {
        message: format!("{method}: envelope has neither response nor error"),
    })
}

#[async_trait]
impl VkApi for VkClient {
    async fn get_group(&self, group_id: i64) -> Result<Group, FetchError> {
        let response: GroupsResponse = self
            .call(
                "groups.getById",
                &[
                    ("group_id", group_id.to_string()),
                    ("fields", "members_count".to_owned()),
                ],
            )
            .await?;

        response
            .into_groups()
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::AccessDenied {
                message: format!("group {group_id} not found"),
            })
    }

    async fn get_posts(
        &self,
        owner_id: i64,
        offset: u64,
        count: u64,
    ) -> Result<Page<Post>, FetchError> {
        let response: ItemsResponse<Post> = self
            .call(
                "wall.get",
                &[
                    ("owner_id", owner_id.to_string()),
                    ("offset", offset.to_string()),
                    ("count", count.to_string()),
                    ("extended", "0".to_owned()),
                ],
            )
            .await?;

        Ok(Page::new(response.items, response.count, offset, count))
    }

    async fn get_comments(
        &self,
        owner_id: i64,
        post_id: i64,
        offset: u64,
        count: u64,
    ) -> Result<Page<Comment>, FetchError> {
        let response: ItemsResponse<Comment> = self
            .call(
                "wall.getComments",
                &[
                    ("owner_id", owner_id.to_string()),
                    ("post_id", post_id.to_string()),
                    ("offset", offset.to_string()),
                    ("count", count.to_string()),
                    ("sort", "asc".to_owned()),
                    ("thread_items_count", THREAD_ITEMS_COUNT.to_string()),
                ],
            )
            .await?;

        let total = response.current_level_count.or(response.count);
        Ok(Page::new(response.items, total, offset, count))
    }

    async fn get_replies(
        &self,
        owner_id: i64,
        post_id: i64,
        comment_id: i64,
        offset: u64,
        count: u64,
    ) -> Result<Page<Comment>, FetchError> {
        let response: ItemsResponse<Comment> = self
            .call(
                "wall.getComments",
                &[
                    ("owner_id", owner_id.to_string()),
                    ("post_id", post_id.to_string()),
                    ("comment_id", comment_id.to_string()),
                    ("offset", offset.to_string()),
                    ("count", count.to_string()),
                    ("sort", "asc".to_owned()),
                ],
            )
            .await?;

        let total = response.current_level_count.or(response.count);
        Ok(Page::new(response.items, total, offset, count))
    }
}
