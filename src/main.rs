//! # Ganesha News
//!
//! Incremental news corpus ingestion with near-duplicate detection and a
//! persisted nearest-neighbor graph used for article recommendations.
//!
//! ## Usage
//!
//! ```sh
//! ganesha_news --data-dir ./data ingest
//! ganesha_news --data-dir ./data recommend --index 42
//! ```
//!
//! ## Architecture
//!
//! One ingestion cycle runs four resumable stages:
//! 1. **Fetch**: discover and download new articles from every source into staging
//! 2. **Dedup**: drop near-duplicate titles published within a time window
//! 3. **Index**: vectorize survivors and insert them into the neighbor graph
//! 4. **Commit**: assign dense indices and move staging into the primary store
//!
//! Query subcommands read the primary store and the neighbor graph.

use clap::Parser;
use serde::Serialize;
use std::error::Error;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod ann;
mod cli;
mod config;
mod dedup;
mod distance;
mod error;
mod fetch;
mod models;
mod pipeline;
mod query;
mod store;
mod text;
mod tfidf;
mod utils;
mod vectorize;

use cli::{Cli, Command};
use config::Config;
use pipeline::{Pipeline, store_counts};
use query::QueryService;
use store::Workspace;
use text::TextNormalizer;
use utils::ensure_writable_dir;
use vectorize::LexiconTopicModel;

#[derive(Serialize)]
struct StatusReport {
    state: String,
    #[serde(flatten)]
    counts: pipeline::StoreCounts,
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Build the ingestion pipeline from configuration.
fn build_pipeline(workspace: Workspace, config: Config) -> Result<Pipeline, Box<dyn Error>> {
    let normalizer = TextNormalizer::with_stop_words(config.stop_words(workspace.root())?);
    let vectorizer = Arc::new(LexiconTopicModel::load(&config.topic_model_path(workspace.root()))?);
    let adapters = fetch::registry(&config)?;
    Ok(Pipeline::new(workspace, config, normalizer, vectorizer, adapters))
}

async fn run(args: Cli) -> Result<(), Box<dyn Error>> {
    let config = Config::load(&args.config_path())?;
    let workspace = Workspace::new(&args.data_dir);
    let k = config.ann.neighbors;

    match args.command {
        Command::Ingest => {
            ensure_writable_dir(workspace.root()).await?;
            let report = build_pipeline(workspace, config)?.run_cycle().await?;
            print_json(&report)
        }
        Command::Status => {
            let counts = store_counts(&workspace, k).await?;
            let state = match counts.state() {
                Ok(state) => format!("{state:?}").to_lowercase(),
                Err(e) => e.to_string(),
            };
            print_json(&StatusReport { state, counts })
        }
        Command::RebuildIndex => {
            let rows = build_pipeline(workspace, config)?.rebuild_index().await?;
            info!(rows, "Index rebuilt; run reload-index on serving processes");
            print_json(&serde_json::json!({ "rows": rows }))
        }
        Command::ReloadIndex => {
            let mut service = QueryService::load(workspace, k).await?;
            print_json(&service.reload().await?)
        }
        Command::Recommend { index, limit } => {
            let service = QueryService::load(workspace, k).await?;
            print_json(&service.article_with_recommendations(index, limit)?)
        }
        Command::Search { keyword, page, limit } => {
            let service = QueryService::load(workspace, k).await?;
            print_json(&service.search(&keyword, page, limit)?)
        }
        Command::List { category, page, limit } => {
            let service = QueryService::load(workspace, k).await?;
            print_json(&service.list(category.as_deref(), page, limit)?)
        }
    }
}

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    let start_time = std::time::Instant::now();
    let args = Cli::parse();
    debug!(data_dir = %args.data_dir.display(), command = ?args.command, "Parsed CLI arguments");

    if let Err(e) = run(args).await {
        error!(error = %e, "Command failed");
        return Err(e);
    }

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        "Execution complete"
    );
    Ok(())
}
