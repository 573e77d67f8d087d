//! YAML configuration for the ingestion pipeline.
//!
//! The configuration is loaded once at startup and passed by reference into
//! every component that needs it; nothing reads settings from globals. A
//! missing file yields [`Config::default`].
//!
//! # Example
//!
//! ```yaml
//! dedup:
//!   similarity_threshold: 0.8
//!   time_window_hours: 5
//! ann:
//!   neighbors: 30
//!   metric: combined
//! text:
//!   stop_words_file: stop_words.txt
//! sources:
//!   - name: dantri
//!     listing_url: "https://dantri.com.vn/{category}/trang-{page}.htm"
//!     max_pages: 30
//!     utc_offset_hours: 7
//!     require_category_in_link: true
//!     categories:
//!       - { slug: xa-hoi, maps_to: thoi-su }
//!       - { slug: the-gioi }
//!     selectors:
//!       listing_item: "article.article-item"
//!       title: "article h1"
//!       published: "article time"
//!       published_attr: datetime
//!       published_format: "%Y-%m-%d %H:%M"
//!       description: ".singular-sapo"
//!       body: ".singular-content"
//! ```

use crate::distance::Metric;
use crate::error::{PipelineError, PipelineResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub dedup: DedupConfig,
    pub ann: AnnConfig,
    pub fetch: FetchConfig,
    pub text: TextConfig,
    /// Path to the lexicon topic model. Relative paths resolve against the
    /// data directory; `None` means `<data-dir>/topic_model.json`.
    pub topic_model: Option<PathBuf>,
    pub sources: Vec<SourceConfig>,
}

/// Near-duplicate detection thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DedupConfig {
    /// Minimum TF-IDF cosine similarity for a similarity candidate.
    pub similarity_threshold: f32,
    /// Candidates published less than this many hours apart are duplicates.
    pub time_window_hours: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.8,
            time_window_hours: 5.0,
        }
    }
}

/// Nearest-neighbor index parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnnConfig {
    /// Neighbors kept per row of the graph.
    pub neighbors: usize,
    pub metric: Metric,
    /// Candidate pool size for graph search during insertion.
    pub search_width: usize,
    /// Below this corpus size, insertion compares against every vector.
    pub exact_below: usize,
    /// Local-join rounds run over rows touched by an insertion batch.
    pub refine_rounds: usize,
    /// Maximum NN-descent iterations for a full rebuild.
    pub build_iterations: usize,
    pub seed: u64,
}

impl Default for AnnConfig {
    fn default() -> Self {
        Self {
            neighbors: 30,
            metric: Metric::Combined,
            search_width: 64,
            exact_below: 256,
            refine_rounds: 1,
            build_iterations: 10,
            seed: 42,
        }
    }
}

/// Fetch politeness budget.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    pub max_concurrent_sources: usize,
    /// Concurrent requests allowed against a single source.
    pub per_source_concurrency: usize,
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sources: 4,
            per_source_concurrency: 8,
            request_timeout_secs: 20,
            user_agent: concat!("ganesha_news/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Text normalization settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TextConfig {
    pub stop_words: Vec<String>,
    /// One stop word per line. Relative paths resolve against the data directory.
    pub stop_words_file: Option<PathBuf>,
    /// Tokens shorter than this are ignored by the TF-IDF space.
    pub min_token_chars: usize,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            stop_words: Vec::new(),
            stop_words_file: None,
            min_token_chars: 2,
        }
    }
}

/// One entry of the source registry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub name: String,
    /// Listing page URL template with `{category}` and `{page}` placeholders.
    pub listing_url: String,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    /// Offset of the publisher's local time zone, used for published dates.
    #[serde(default)]
    pub utc_offset_hours: i32,
    /// Skip discovered links whose URL does not contain the category slug.
    #[serde(default)]
    pub require_category_in_link: bool,
    pub categories: Vec<CategoryMapping>,
    pub selectors: SelectorConfig,
}

fn default_max_pages() -> u32 {
    20
}

impl SourceConfig {
    /// Corpus category for a source category slug.
    pub fn corpus_category(&self, slug: &str) -> String {
        self.categories
            .iter()
            .find(|c| c.slug == slug)
            .and_then(|c| c.maps_to.clone())
            .unwrap_or_else(|| slug.to_string())
    }
}

/// A source category slug and the corpus category it is filed under.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CategoryMapping {
    pub slug: String,
    /// Defaults to `slug` when absent.
    #[serde(default)]
    pub maps_to: Option<String>,
}

/// CSS selectors driving the HTML fetch adapter.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectorConfig {
    /// One element per article on a listing page.
    pub listing_item: String,
    #[serde(default = "default_link")]
    pub listing_link: String,
    #[serde(default = "default_image")]
    pub listing_thumbnail: String,
    pub title: String,
    pub published: String,
    /// Attribute holding the timestamp; the element text is used when absent.
    #[serde(default)]
    pub published_attr: Option<String>,
    /// `chrono` format string for the timestamp.
    pub published_format: String,
    pub description: String,
    /// Prefix stripped from descriptions, e.g. a publisher byline.
    #[serde(default)]
    pub description_prefix: Option<String>,
    /// Container whose direct children make up the article body.
    pub body: String,
    /// Children matching this selector become image groups.
    #[serde(default)]
    pub image_group: Option<String>,
}

fn default_link() -> String {
    "a[href]".to_string()
}

fn default_image() -> String {
    "img".to_string()
}

impl Config {
    /// Load configuration from a YAML file, falling back to defaults when the
    /// file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] when the file exists but cannot be
    /// parsed or fails validation.
    #[instrument(level = "info", fields(path = %path.display()))]
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(raw) => serde_yaml::from_str::<Config>(&raw)
                .map_err(|e| PipelineError::Config(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file not found; using defaults");
                Config::default()
            }
            Err(e) => return Err(PipelineError::io(path, e)),
        };
        config.validate()?;
        info!(sources = config.sources.len(), "Loaded configuration");
        Ok(config)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> PipelineResult<()> {
        let t = self.dedup.similarity_threshold;
        if !(0.0..=1.0).contains(&t) {
            return Err(PipelineError::Config(format!(
                "dedup.similarity_threshold must be within [0, 1], got {t}"
            )));
        }
        if self.dedup.time_window_hours < 0.0 {
            return Err(PipelineError::Config(
                "dedup.time_window_hours must not be negative".to_string(),
            ));
        }
        if self.ann.neighbors == 0 {
            return Err(PipelineError::Config("ann.neighbors must be positive".to_string()));
        }
        if self.fetch.per_source_concurrency == 0 || self.fetch.max_concurrent_sources == 0 {
            return Err(PipelineError::Config(
                "fetch concurrency limits must be positive".to_string(),
            ));
        }
        let mut names = std::collections::HashSet::new();
        for source in &self.sources {
            if !names.insert(source.name.as_str()) {
                return Err(PipelineError::Config(format!(
                    "source '{}' is configured twice",
                    source.name
                )));
            }
            if !source.listing_url.contains("{page}") {
                return Err(PipelineError::Config(format!(
                    "source '{}' listing_url has no {{page}} placeholder",
                    source.name
                )));
            }
        }
        Ok(())
    }

    /// Path of the topic model, resolved against `data_dir`.
    pub fn topic_model_path(&self, data_dir: &Path) -> PathBuf {
        match &self.topic_model {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => data_dir.join(p),
            None => data_dir.join("topic_model.json"),
        }
    }

    /// Inline stop words plus those read from `text.stop_words_file`.
    pub fn stop_words(&self, data_dir: &Path) -> PipelineResult<Vec<String>> {
        let mut words = self.text.stop_words.clone();
        if let Some(file) = &self.text.stop_words_file {
            let path = if file.is_absolute() {
                file.clone()
            } else {
                data_dir.join(file)
            };
            let raw = std::fs::read_to_string(&path).map_err(|e| PipelineError::io(&path, e))?;
            words.extend(
                raw.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string),
            );
        }
        Ok(words)
    }
}
