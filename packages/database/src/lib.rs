#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Storage boundary for ingested VK records.
//!
//! The ingestion worker writes through the [`RecordStore`] trait, one call
//! per record. Implementations upsert by VK identity so that re-ingesting a
//! group never creates duplicate rows. [`memory::MemoryStore`] is the
//! in-process implementation used by the CLI and tests.

pub mod memory;

use async_trait::async_trait;
use vk_ingest_source_models::{Comment, Group, Post};

/// Errors that can occur while persisting a record.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The store refused this record.
    #[error("Record rejected: {message}")]
    Rejected {
        /// Description of what went wrong.
        message: String,
    },

    /// The backing store could not be reached.
    #[error("Storage unavailable: {message}")]
    Unavailable {
        /// Description of what went wrong.
        message: String,
    },

    /// Serializing records failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Whether an upsert created a new row or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// No record with this identity existed.
    Inserted,
    /// An existing record was overwritten.
    Updated,
}

/// Durable sink for ingested records.
///
/// Identity is `id` for groups and `(owner_id, id)` for posts and
/// comments. Saving a record whose identity already exists replaces it.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Upserts a group.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the record cannot be written.
    async fn save_group(&self, group: &Group) -> Result<SaveOutcome, StorageError>;

    /// Upserts a post.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the record cannot be written.
    async fn save_post(&self, post: &Post) -> Result<SaveOutcome, StorageError>;

    /// Upserts a comment.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the record cannot be written.
    async fn save_comment(&self, comment: &Comment) -> Result<SaveOutcome, StorageError>;
}
