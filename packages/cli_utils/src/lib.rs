#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared CLI utilities for the VK ingestion worker.
//!
//! Provides an `indicatif`-backed [`ProgressCallback`], plus [`init_logger`]
//! which sets up `indicatif-log-bridge` so that `log::info!` and friends
//! are suspended while progress bars redraw.
//!
//! Any binary that calls [`init_logger()`] at startup gets full progress bar
//! support for free.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use vk_ingest_models::progress::ProgressCallback;
use vk_ingest_models::{PhaseCounters, TaskId, TaskProgress, TaskStatus};

pub use indicatif::MultiProgress;

/// An `indicatif` [`ProgressBar`] that follows one ingestion task.
pub struct IndicatifProgress {
    bar: ProgressBar,
    /// Style to switch to once the first total is known.
    bar_style: ProgressStyle,
    has_total: AtomicBool,
}

impl IndicatifProgress {
    /// Creates a progress bar that starts as a spinner (no total known)
    /// and switches to a full bar with percentage/ETA once the task has
    /// discovered its first posts.
    #[must_use]
    pub fn task_bar(multi: &MultiProgress, message: &str) -> Arc<dyn ProgressCallback> {
        let bar = multi.add(ProgressBar::new_spinner());
        bar.enable_steady_tick(Duration::from_millis(100));
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(message.to_string());

        let bar_style = ProgressStyle::with_template(
            "  {prefix} {wide_bar:.cyan/dim} {pos}/{len} {percent}% [{eta}] {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");

        Arc::new(Self {
            bar,
            bar_style,
            has_total: AtomicBool::new(false),
        })
    }
}

fn counters_message(counters: &PhaseCounters) -> String {
    format!(
        "{} posts, {} comments, {} errors",
        counters.posts_saved, counters.comments_saved, counters.errors
    )
}

impl ProgressCallback for IndicatifProgress {
    fn on_progress(&self, _task_id: TaskId, progress: TaskProgress, counters: PhaseCounters) {
        if progress.total > 0 && !self.has_total.swap(true, Ordering::Relaxed) {
            // Switch from spinner to bar style now that we know the total.
            self.bar.set_style(self.bar_style.clone());
        }
        self.bar.set_length(progress.total);
        self.bar.set_position(progress.processed);
        self.bar.set_message(counters_message(&counters));
    }

    fn on_group_started(&self, _task_id: TaskId, group_id: i64, position: usize, of: usize) {
        self.bar.set_prefix(format!("group {group_id} ({position}/{of})"));
    }

    fn on_finished(&self, _task_id: TaskId, status: TaskStatus, summary: &str) {
        self.bar.finish_with_message(format!("{status}: {summary}"));
    }
}

/// Initializes the global logger wrapped in `indicatif-log-bridge` so that
/// `log::info!` and friends are suspended while progress bars redraw.
///
/// Returns the [`MultiProgress`] that all progress bars must be added to.
#[must_use]
pub fn init_logger() -> MultiProgress {
    let multi = MultiProgress::new();

    let logger = pretty_env_logger::formatted_builder()
        .parse_env("RUST_LOG")
        .build();
    let level = logger.filter();

    indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
        .try_init()
        .ok(); // Ignore error if logger was already set (e.g., in tests)

    log::set_max_level(level);

    multi
}
