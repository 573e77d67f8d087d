//! Article sources and the fetch stage.
//!
//! Every publisher is reached through one [`FetchAdapter`] capability. The
//! registry built by [`registry`] turns each configured source into a
//! [`SelectorAdapter`], so adding a publisher is a configuration change.
//!
//! Each source follows the same two-phase pattern:
//!
//! 1. **Discovery**: walk the category listing pages and collect article links
//! 2. **Fetching**: download and parse article content from each link
//!
//! Per-article failures are values ([`FetchFailure`]), never errors: the
//! [`collector`] decides which of them end up on the blacklist.

pub mod collector;
pub mod html;

pub use collector::{FetchReport, collect};
pub use html::SelectorAdapter;

use crate::config::Config;
use crate::error::{FetchFailure, PipelineResult};
use crate::models::ContentBlock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// A source category and the corpus category its articles are filed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceCategory {
    pub slug: String,
    pub corpus: String,
}

/// A link found on a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredLink {
    pub uri: String,
    pub thumbnail_uri: Option<String>,
}

/// Result of walking one category's listing pages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    /// Links in listing order, first page first.
    pub links: Vec<DiscoveredLink>,
    /// Listing entries that lack the expected shape (e.g. no thumbnail).
    pub failed: HashSet<String>,
}

/// Article content extracted from a page; the collector adds provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedArticle {
    pub title: String,
    pub description: String,
    pub published_at: DateTime<Utc>,
    pub content: Vec<ContentBlock>,
}

/// One publisher's link discovery and content extraction.
#[async_trait]
pub trait FetchAdapter: Send + Sync {
    /// Source name, used as the `source` of staged articles and blacklist entries.
    fn name(&self) -> &str;

    fn categories(&self) -> Vec<SourceCategory>;

    /// Listing pages walked per category.
    fn max_pages(&self) -> u32;

    /// Collect article links from the first `max_pages` listing pages of a
    /// category. Listing pages that cannot be loaded are skipped.
    async fn discover_links(&self, category: &str, max_pages: u32) -> Discovery;

    /// Fetch and parse one article.
    async fn fetch_content(&self, uri: &str) -> Result<FetchedArticle, FetchFailure>;
}

/// Build one adapter per configured source.
///
/// # Errors
///
/// Fails when a source has an invalid CSS selector or the HTTP client cannot
/// be constructed.
pub fn registry(config: &Config) -> PipelineResult<Vec<Arc<dyn FetchAdapter>>> {
    let mut adapters: Vec<Arc<dyn FetchAdapter>> = Vec::with_capacity(config.sources.len());
    for source in &config.sources {
        adapters.push(Arc::new(SelectorAdapter::new(source.clone(), &config.fetch)?));
    }
    info!(count = adapters.len(), "Built fetch adapter registry");
    Ok(adapters)
}
