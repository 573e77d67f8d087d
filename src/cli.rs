//! Command-line interface definitions for Ganesha News.
//!
//! This module defines the CLI arguments and subcommands using the `clap`
//! crate. The data directory and configuration path can also be provided via
//! environment variables.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command-line arguments for the Ganesha News application.
///
/// # Examples
///
/// ```sh
/// # Run one ingestion cycle
/// ganesha_news --data-dir ./data ingest
///
/// # Recommendations for article 42
/// ganesha_news -d ./data recommend --index 42 --limit 5
///
/// # Search, second page
/// GANESHA_DATA_DIR=./data ganesha_news search "bão số 3" --page 2
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Directory holding the corpus, staging area and index files
    #[arg(short, long, env = "GANESHA_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Path to config.yaml (defaults to <data-dir>/config.yaml)
    #[arg(short, long, env = "GANESHA_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| self.data_dir.join("config.yaml"))
    }
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run one ingestion cycle: fetch, dedup, index, commit
    Ingest,

    /// Show store sizes and the derived pipeline state
    Status,

    /// Rebuild the nearest-neighbor index over the whole corpus
    RebuildIndex,

    /// Load the on-disk neighbor graph the way a running server reloads it
    ReloadIndex,

    /// Recommendations for one article
    Recommend {
        /// Dense index of the article
        #[arg(short, long)]
        index: u32,

        /// Number of recommendations (5-20)
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Search titles and descriptions
    Search {
        keyword: String,

        #[arg(short, long)]
        page: Option<usize>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// List articles of a category, newest first
    List {
        /// Category slug; `latest` lists every category
        #[arg(short, long)]
        category: Option<String>,

        #[arg(short, long)]
        page: Option<usize>,

        #[arg(short, long)]
        limit: Option<usize>,
    },
}
