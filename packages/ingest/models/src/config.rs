//! Tunables for the ingestion worker.
//!
//! Every field has a default, so a TOML file only needs the keys it
//! changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Largest `count` VK accepts on `wall.get` and `wall.getComments`.
pub const VK_MAX_PAGE_SIZE: u64 = 100;

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct IngestConfig {
    /// VK API host.
    pub api_url: String,
    /// Value of the `v` parameter.
    pub api_version: String,
    /// Steady-state token refill rate.
    pub requests_per_second: u32,
    /// Token bucket capacity.
    pub burst: u32,
    /// Total attempts per request.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_secs: u64,
    pub posts_page_size: u64,
    pub comments_page_size: u64,
    /// Stop after this many posts per group.
    pub max_posts_per_group: Option<u64>,
    /// Stop after this many comments per post.
    pub max_comments_per_post: Option<u64>,
    /// Posts whose comments are fetched concurrently within a group.
    pub comment_workers: usize,
    /// Time budget for one group; exceeding it fails that group only.
    pub group_timeout_secs: Option<u64>,
    /// Cap on the per-task error list.
    pub max_task_errors: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.vk.com".to_owned(),
            api_version: "5.199".to_owned(),
            requests_per_second: 3,
            burst: 10,
            max_retries: 5,
            backoff_base_ms: 1_000,
            max_backoff_ms: 32_000,
            request_timeout_secs: 30,
            posts_page_size: VK_MAX_PAGE_SIZE,
            comments_page_size: VK_MAX_PAGE_SIZE,
            max_posts_per_group: None,
            max_comments_per_post: None,
            comment_workers: 3,
            group_timeout_secs: Some(900),
            max_task_errors: 50,
        }
    }
}

impl IngestConfig {
    #[must_use]
    pub const fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn group_timeout(&self) -> Option<Duration> {
        self.group_timeout_secs.map(Duration::from_secs)
    }

    /// Lists every constraint this configuration violates.
    #[must_use]
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.requests_per_second == 0 {
            problems.push("requests_per_second must be greater than 0".to_owned());
        }
        if self.burst == 0 {
            problems.push("burst must be at least 1".to_owned());
        }
        if self.max_retries == 0 {
            problems.push("max_retries must be at least 1".to_owned());
        }
        for (name, size) in [
            ("posts_page_size", self.posts_page_size),
            ("comments_page_size", self.comments_page_size),
        ] {
            if !(1..=VK_MAX_PAGE_SIZE).contains(&size) {
                problems.push(format!("{name} must be between 1 and {VK_MAX_PAGE_SIZE}"));
            }
        }
        if self.comment_workers == 0 {
            problems.push("comment_workers must be at least 1".to_owned());
        }
        if self.max_task_errors == 0 {
            problems.push("max_task_errors must be at least 1".to_owned());
        }
        if self.api_url.trim().is_empty() {
            problems.push("api_url must not be empty".to_owned());
        }

        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(IngestConfig::default().problems().is_empty());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: IngestConfig = toml::from_str(
            r"
            requests_per_second = 1
            comment_workers = 5
            max_posts_per_group = 200
            ",
        )
        .unwrap();

        assert_eq!(config.requests_per_second, 1);
        assert_eq!(config.comment_workers, 5);
        assert_eq!(config.max_posts_per_group, Some(200));
        assert_eq!(config.burst, 10);
        assert_eq!(config.posts_page_size, VK_MAX_PAGE_SIZE);
    }

    #[test]
    fn reports_every_problem() {
        let config = IngestConfig {
            requests_per_second: 0,
            posts_page_size: 500,
            comment_workers: 0,
            ..IngestConfig::default()
        };

        let problems = config.problems();
        assert_eq!(problems.len(), 3, "{problems:?}");
        assert!(problems.iter().any(|p| p.starts_with("posts_page_size")));
    }
}
