#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the VK ingestion worker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use vk_ingest::config::{Settings, parse_group_ids};
use vk_ingest::manager::TaskManager;
use vk_ingest::tracker::TaskTracker;
use vk_ingest::{Ingestor, rate_limiter};
use vk_ingest_cli_utils::IndicatifProgress;
use vk_ingest_database::memory::MemoryStore;
use vk_ingest_models::TaskStatus;
use vk_ingest_source::AccessToken;
use vk_ingest_source::client::VkClient;

#[derive(Parser)]
#[command(name = "vk_ingest", about = "VK group wall ingestion tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every post and comment of the given groups
    Run {
        /// Comma-separated VK group ids (e.g., "1,club22822305")
        #[arg(long)]
        groups: String,
        /// TOML file with worker settings
        #[arg(long)]
        config: Option<PathBuf>,
        /// VK access token (overrides `VK_ACCESS_TOKEN`)
        #[arg(long)]
        token: Option<String>,
        /// Write all fetched records to this file as JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML
    Config {
        /// TOML file with worker settings
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = vk_ingest_cli_utils::init_logger();
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { config } => {
            let settings = Settings::load(config.as_deref())?;
            print!("{}", toml::to_string_pretty(&settings.config)?);
        }
        Commands::Run {
            groups,
            config,
            token,
            output,
        } => {
            let group_ids = parse_group_ids(&groups)?;
            let settings = Settings::load(config.as_deref())?;
            let token = token
                .map(AccessToken::new)
                .or(settings.access_token)
                .ok_or("No access token: pass --token or set VK_ACCESS_TOKEN")?;
            let config = settings.config;

            let api = VkClient::with_options(
                token,
                &config.api_url,
                &config.api_version,
                config.request_timeout(),
            )?;
            let store = Arc::new(MemoryStore::new());
            let progress = IndicatifProgress::task_bar(&multi, "Starting");
            let tracker = Arc::new(TaskTracker::new(config.max_task_errors, progress));
            let ingestor = Ingestor::new(
                Arc::new(api),
                store.clone(),
                rate_limiter(&config),
                tracker,
                config,
            );
            let manager = Arc::new(TaskManager::new(Arc::new(ingestor)));

            let start = Instant::now();
            log::info!("Ingesting {} group(s): {groups}", group_ids.len());
            let task_id = manager.submit(group_ids);

            let interrupt = Arc::clone(&manager);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("Interrupted, cancelling task {task_id}...");
                    interrupt.cancel(task_id);
                }
            });

            let status = manager.wait(task_id).await;
            log::info!(
                "Task {task_id} finished in {:.1}s",
                start.elapsed().as_secs_f64()
            );

            if let Some(view) = manager.status(task_id) {
                println!("{}", serde_json::to_string_pretty(&view)?);
            }

            if let Some(path) = output {
                std::fs::write(&path, store.export_json()?)?;
                let counts = store.counts();
                log::info!(
                    "Wrote {} groups, {} posts, {} comments to {}",
                    counts.groups,
                    counts.posts,
                    counts.comments,
                    path.display()
                );
            }

            match status {
                Some(TaskStatus::Completed) => {}
                Some(status) => return Err(format!("Task {task_id} ended {status}").into()),
                None => return Err(format!("Task {task_id} disappeared").into()),
            }
        }
    }

    Ok(())
}
