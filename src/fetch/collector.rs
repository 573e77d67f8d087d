//! The fetch stage: discover, claim and fetch new articles from every source.
//!
//! Sources are processed concurrently, up to `fetch.max_concurrent_sources`
//! at a time; within a source, article pages are fetched concurrently up to
//! `fetch.per_source_concurrency`. Links are claimed against one shared seen
//! set (committed ∪ blacklisted ∪ already claimed this run), so an article
//! listed under several categories is fetched once.
//!
//! The report is ordered by (source, category, listing position), independent
//! of the order in which requests complete.

use crate::config::FetchConfig;
use crate::error::FetchFailure;
use crate::fetch::{DiscoveredLink, FetchAdapter, FetchedArticle};
use crate::models::{BlacklistEntry, StagedArticle};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

type SeenSet = Arc<Mutex<HashSet<(String, String)>>>;

/// Outcome of one fetch stage.
#[derive(Debug, Default)]
pub struct FetchReport {
    /// New articles, ready for staging.
    pub staged: Vec<StagedArticle>,
    /// Structural failures, permanently excluded.
    pub blacklist: Vec<BlacklistEntry>,
    /// Transient failures; these links are retried next cycle.
    pub transient: usize,
}

/// A claimed link with its position, used to restore deterministic order.
struct Claim {
    category_idx: usize,
    link_idx: usize,
    corpus_category: String,
    link: DiscoveredLink,
}

/// Run discovery and content fetch across every adapter.
///
/// # Arguments
///
/// * `adapters` - The source registry
/// * `known` - `(source, uri)` keys already committed or blacklisted
/// * `config` - Concurrency limits
#[instrument(level = "info", skip_all, fields(sources = adapters.len(), known = known.len()))]
pub async fn collect(
    adapters: &[Arc<dyn FetchAdapter>],
    known: HashSet<(String, String)>,
    config: &FetchConfig,
) -> FetchReport {
    let seen: SeenSet = Arc::new(Mutex::new(known));

    let mut per_source: Vec<(usize, FetchReport)> = stream::iter(adapters.iter().enumerate())
        .map(|(idx, adapter)| {
            let seen = Arc::clone(&seen);
            async move {
                let report =
                    collect_source(adapter.as_ref(), seen, config.per_source_concurrency).await;
                (idx, report)
            }
        })
        .buffer_unordered(config.max_concurrent_sources)
        .collect()
        .await;
    per_source.sort_by_key(|(idx, _)| *idx);

    let mut report = FetchReport::default();
    for (_, source_report) in per_source {
        report.staged.extend(source_report.staged);
        report.blacklist.extend(source_report.blacklist);
        report.transient += source_report.transient;
    }
    info!(
        staged = report.staged.len(),
        blacklisted = report.blacklist.len(),
        transient = report.transient,
        "Fetch stage collected articles"
    );
    report
}

#[instrument(level = "info", skip_all, fields(source = adapter.name()))]
async fn collect_source(
    adapter: &dyn FetchAdapter,
    seen: SeenSet,
    concurrency: usize,
) -> FetchReport {
    let source = adapter.name().to_string();
    let categories = adapter.categories();
    let max_pages = adapter.max_pages();

    let discoveries = join_all(
        categories
            .iter()
            .map(|category| adapter.discover_links(&category.slug, max_pages)),
    )
    .await;

    let mut report = FetchReport::default();
    let mut claims = Vec::new();
    {
        let mut seen = seen.lock().await;
        for (category_idx, (category, discovery)) in
            categories.iter().zip(discoveries).enumerate()
        {
            for uri in discovery.failed.into_iter().sorted() {
                if seen.insert((source.clone(), uri.clone())) {
                    report.blacklist.push(BlacklistEntry::structural(&source, &uri));
                }
            }
            for (link_idx, link) in discovery.links.into_iter().enumerate() {
                if seen.insert((source.clone(), link.uri.clone())) {
                    claims.push(Claim {
                        category_idx,
                        link_idx,
                        corpus_category: category.corpus.clone(),
                        link,
                    });
                }
            }
        }
    }
    info!(claimed = claims.len(), "Claimed new links");

    let mut fetched: Vec<(Claim, Result<FetchedArticle, FetchFailure>)> = stream::iter(claims)
        .map(|claim| async move {
            let result = adapter.fetch_content(&claim.link.uri).await;
            (claim, result)
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;
    fetched.sort_by_key(|(claim, _)| (claim.category_idx, claim.link_idx));

    for (claim, result) in fetched {
        match result {
            Ok(article) => report.staged.push(StagedArticle {
                source: source.clone(),
                uri: claim.link.uri,
                title: article.title,
                description: article.description,
                published_at: article.published_at,
                content: article.content,
                thumbnail_uri: claim.link.thumbnail_uri,
                category: claim.corpus_category,
            }),
            Err(failure) if failure.reason.is_structural() => {
                warn!(uri = %failure.uri, reason = %failure.reason, "Blacklisting article");
                report.blacklist.push(BlacklistEntry::structural(&source, &failure.uri));
            }
            Err(failure) => {
                warn!(
                    uri = %failure.uri,
                    reason = %failure.reason,
                    "Article will be retried next cycle"
                );
                report.transient += 1;
            }
        }
    }
    report
}

#[cfg(test)]
pub(crate) mod stub {
    use super::*;
    use crate::fetch::{Discovery, SourceCategory};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;

    /// In-memory adapter: fixed listings per category, fixed page outcomes.
    pub struct StubAdapter {
        pub name: String,
        pub categories: Vec<SourceCategory>,
        pub listings: HashMap<String, Discovery>,
        pub pages: HashMap<String, Result<FetchedArticle, FetchFailure>>,
    }

    impl StubAdapter {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                categories: Vec::new(),
                listings: HashMap::new(),
                pages: HashMap::new(),
            }
        }

        pub fn category(mut self, slug: &str, corpus: &str, links: &[&str]) -> Self {
            self.categories.push(SourceCategory {
                slug: slug.to_string(),
                corpus: corpus.to_string(),
            });
            let discovery = self.listings.entry(slug.to_string()).or_default();
            discovery.links.extend(links.iter().map(|uri| DiscoveredLink {
                uri: uri.to_string(),
                thumbnail_uri: Some(format!("{uri}.jpg")),
            }));
            self
        }

        pub fn without_thumbnail(mut self, slug: &str, uri: &str) -> Self {
            self.listings
                .entry(slug.to_string())
                .or_default()
                .failed
                .insert(uri.to_string());
            self
        }

        pub fn page(mut self, uri: &str, title: &str, published_at: DateTime<Utc>) -> Self {
            self.pages.insert(
                uri.to_string(),
                Ok(FetchedArticle {
                    title: title.to_string(),
                    description: format!("{title} description"),
                    published_at,
                    content: vec![crate::models::ContentBlock::Text {
                        text: format!("{title} body"),
                    }],
                }),
            );
            self
        }

        pub fn failing(mut self, failure: FetchFailure) -> Self {
            self.pages.insert(failure.uri.clone(), Err(failure));
            self
        }
    }

    #[async_trait]
    impl FetchAdapter for StubAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        fn categories(&self) -> Vec<SourceCategory> {
            self.categories.clone()
        }

        fn max_pages(&self) -> u32 {
            1
        }

        async fn discover_links(&self, category: &str, _max_pages: u32) -> Discovery {
            self.listings.get(category).cloned().unwrap_or_default()
        }

        async fn fetch_content(&self, uri: &str) -> Result<FetchedArticle, FetchFailure> {
            self.pages
                .get(uri)
                .cloned()
                .unwrap_or_else(|| Err(FetchFailure::transient(uri, "connection reset")))
        }
    }
}
