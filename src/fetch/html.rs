//! Selector-driven HTML adapter.
//!
//! One [`SelectorAdapter`] serves any publisher whose listing and article
//! pages can be described by the CSS selectors in its [`SourceConfig`].
//!
//! # URL Pattern
//!
//! Listing pages are built from the source's `listing_url` template, e.g.
//! `https://dantri.com.vn/{category}/trang-{page}.htm`. Article links on a
//! listing page are resolved against the page URL.
//!
//! # Politeness
//!
//! Every request first takes a permit from the adapter's semaphore, so no
//! more than `fetch.per_source_concurrency` requests are in flight against
//! one publisher at a time.

use crate::config::{FetchConfig, SourceConfig};
use crate::error::{FetchFailure, PipelineError, PipelineResult};
use crate::fetch::{DiscoveredLink, Discovery, FetchAdapter, FetchedArticle, SourceCategory};
use crate::models::{ContentBlock, ImageRef};
use crate::utils::truncate_for_log;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use scraper::{ElementRef, Html, Selector};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Selectors compiled once when the adapter is built.
#[derive(Debug)]
struct CompiledSelectors {
    listing_item: Selector,
    listing_link: Selector,
    listing_thumbnail: Selector,
    title: Selector,
    published: Selector,
    description: Selector,
    body: Selector,
    image_group: Option<Selector>,
    image: Selector,
    figcaption: Selector,
}

fn compile(source: &str, field: &str, css: &str) -> PipelineResult<Selector> {
    Selector::parse(css).map_err(|e| {
        PipelineError::Config(format!("source '{source}' selector {field} '{css}': {e:?}"))
    })
}

impl CompiledSelectors {
    fn new(source: &SourceConfig) -> PipelineResult<Self> {
        let s = &source.selectors;
        let name = source.name.as_str();
        Ok(Self {
            listing_item: compile(name, "listing_item", &s.listing_item)?,
            listing_link: compile(name, "listing_link", &s.listing_link)?,
            listing_thumbnail: compile(name, "listing_thumbnail", &s.listing_thumbnail)?,
            title: compile(name, "title", &s.title)?,
            published: compile(name, "published", &s.published)?,
            description: compile(name, "description", &s.description)?,
            body: compile(name, "body", &s.body)?,
            image_group: s
                .image_group
                .as_deref()
                .map(|css| compile(name, "image_group", css))
                .transpose()?,
            image: compile(name, "image", "img")?,
            figcaption: compile(name, "figcaption", "figcaption")?,
        })
    }
}

/// HTML fetch adapter configured by CSS selectors.
#[derive(Debug)]
pub struct SelectorAdapter {
    source: SourceConfig,
    selectors: CompiledSelectors,
    client: reqwest::Client,
    budget: Arc<Semaphore>,
    per_source_concurrency: usize,
}

impl SelectorAdapter {
    /// Build an adapter for `source`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Config`] for an invalid selector, [`PipelineError::Http`]
    /// when the HTTP client cannot be built.
    pub fn new(source: SourceConfig, fetch: &FetchConfig) -> PipelineResult<Self> {
        let selectors = CompiledSelectors::new(&source)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(fetch.request_timeout_secs))
            .user_agent(fetch.user_agent.clone())
            .build()?;
        Ok(Self {
            source,
            selectors,
            client,
            budget: Arc::new(Semaphore::new(fetch.per_source_concurrency)),
            per_source_concurrency: fetch.per_source_concurrency,
        })
    }

    fn listing_url(&self, category: &str, page: u32) -> String {
        self.source
            .listing_url
            .replace("{category}", category)
            .replace("{page}", &page.to_string())
    }

    /// GET `url` within the politeness budget.
    ///
    /// Client errors (4xx) are structural: the page is gone or never existed.
    /// Everything else that goes wrong is transient.
    async fn get_html(&self, url: &str) -> Result<String, FetchFailure> {
        let _permit = self
            .budget
            .acquire()
            .await
            .map_err(|e| FetchFailure::transient(url, e.to_string()))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchFailure::transient(url, e.to_string()))?;
        let status = response.status();
        if status.is_client_error() {
            return Err(FetchFailure::structural(url, format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(FetchFailure::transient(url, format!("HTTP {status}")));
        }
        response
            .text()
            .await
            .map_err(|e| FetchFailure::transient(url, e.to_string()))
    }

    #[instrument(level = "debug", skip(self), fields(source = %self.source.name))]
    async fn load_listing(&self, category: &str, page: u32) -> Discovery {
        let url = self.listing_url(category, page);
        match self.get_html(&url).await {
            Ok(html) => self.parse_listing(&html, &url, category),
            Err(failure) => {
                warn!(%url, reason = %failure.reason, "Listing page skipped");
                Discovery::default()
            }
        }
    }

    /// Extract article links from a listing page.
    ///
    /// Entries without a thumbnail image are reported in `failed`.
    fn parse_listing(&self, html: &str, page_url: &str, category: &str) -> Discovery {
        let mut discovery = Discovery::default();
        let Ok(base) = Url::parse(page_url) else {
            warn!(url = page_url, "Listing URL is not absolute");
            return discovery;
        };
        let document = Html::parse_document(html);
        for item in document.select(&self.selectors.listing_item) {
            let Some(uri) = item
                .select(&self.selectors.listing_link)
                .next()
                .and_then(|a| a.value().attr("href"))
                .and_then(|href| base.join(href).ok())
                .map(|u| u.to_string())
            else {
                continue;
            };
            if self.source.require_category_in_link && !uri.contains(category) {
                continue;
            }
            match item
                .select(&self.selectors.listing_thumbnail)
                .next()
                .and_then(|img| image_src(img, &base))
            {
                Some(thumbnail) => discovery.links.push(DiscoveredLink {
                    uri,
                    thumbnail_uri: Some(thumbnail),
                }),
                None => {
                    discovery.failed.insert(uri);
                }
            }
        }
        discovery
    }

    /// Extract an article from its page.
    fn parse_article(&self, html: &str, uri: &str) -> Result<FetchedArticle, FetchFailure> {
        let base = Url::parse(uri).map_err(|e| FetchFailure::structural(uri, e.to_string()))?;
        let document = Html::parse_document(html);
        let s = &self.selectors;

        let title = document
            .select(&s.title)
            .next()
            .map(element_text)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| FetchFailure::structural(uri, "missing title"))?;

        let published_raw = document
            .select(&s.published)
            .next()
            .and_then(|el| match &self.source.selectors.published_attr {
                Some(attr) => el.value().attr(attr).map(str::to_string),
                None => Some(element_text(el)),
            })
            .ok_or_else(|| FetchFailure::structural(uri, "missing published time"))?;
        let published_at = parse_published(
            &published_raw,
            &self.source.selectors.published_format,
            self.source.utc_offset_hours,
        )
        .ok_or_else(|| {
            FetchFailure::structural(
                uri,
                format!("unparseable published time '{}'", truncate_for_log(&published_raw, 64)),
            )
        })?;

        let mut description = document
            .select(&s.description)
            .next()
            .map(element_text)
            .unwrap_or_default();
        if let Some(prefix) = &self.source.selectors.description_prefix {
            if let Some(rest) = description.strip_prefix(prefix.as_str()) {
                description = rest.trim().to_string();
            }
        }

        let container = document
            .select(&s.body)
            .next()
            .ok_or_else(|| FetchFailure::structural(uri, "missing body"))?;
        let content = self.content_blocks(container, &base);
        if !content.iter().any(|b| matches!(b, ContentBlock::Text { .. })) {
            return Err(FetchFailure::structural(uri, "NO CONTENT"));
        }

        Ok(FetchedArticle {
            title,
            description,
            published_at,
            content,
        })
    }

    /// Body blocks from the direct children of the body container.
    fn content_blocks(&self, container: ElementRef<'_>, base: &Url) -> Vec<ContentBlock> {
        let s = &self.selectors;
        let mut blocks = Vec::new();
        for child in container.children().filter_map(ElementRef::wrap) {
            if s.image_group.as_ref().is_some_and(|sel| sel.matches(&child)) {
                let images: Vec<ImageRef> = child
                    .select(&s.image)
                    .filter_map(|img| {
                        image_src(img, base).map(|uri| ImageRef {
                            uri,
                            caption: img.value().attr("alt").unwrap_or_default().trim().to_string(),
                        })
                    })
                    .collect();
                if !images.is_empty() {
                    blocks.push(ContentBlock::ImageGroup { images });
                }
                continue;
            }
            match child.value().name() {
                "p" | "h2" | "h3" | "h4" => {
                    let text = element_text(child);
                    if !text.is_empty() {
                        blocks.push(ContentBlock::Text { text });
                    }
                }
                "figure" => {
                    let image = child.select(&s.image).next();
                    if let Some(uri) = image.and_then(|img| image_src(img, base)) {
                        let caption = child
                            .select(&s.figcaption)
                            .next()
                            .map(element_text)
                            .unwrap_or_default();
                        blocks.push(ContentBlock::Image { uri, caption });
                    }
                }
                _ => {}
            }
        }
        blocks
    }
}

#[async_trait]
impl FetchAdapter for SelectorAdapter {
    fn name(&self) -> &str {
        &self.source.name
    }

    fn categories(&self) -> Vec<SourceCategory> {
        self.source
            .categories
            .iter()
            .map(|c| SourceCategory {
                slug: c.slug.clone(),
                corpus: self.source.corpus_category(&c.slug),
            })
            .collect()
    }

    fn max_pages(&self) -> u32 {
        self.source.max_pages
    }

    #[instrument(level = "info", skip(self), fields(source = %self.source.name))]
    async fn discover_links(&self, category: &str, max_pages: u32) -> Discovery {
        let pages: Vec<Discovery> = stream::iter(1..=max_pages)
            .map(|page| self.load_listing(category, page))
            .buffered(self.per_source_concurrency)
            .collect()
            .await;

        let mut merged = Discovery::default();
        for page in pages {
            merged.links.extend(page.links);
            merged.failed.extend(page.failed);
        }
        info!(
            links = merged.links.len(),
            failed = merged.failed.len(),
            "Discovered article links"
        );
        merged
    }

    #[instrument(level = "debug", skip(self), fields(source = %self.source.name))]
    async fn fetch_content(&self, uri: &str) -> Result<FetchedArticle, FetchFailure> {
        let html = self.get_html(uri).await?;
        let article = self.parse_article(&html, uri)?;
        debug!(title = %truncate_for_log(&article.title, 80), "Parsed article");
        Ok(article)
    }
}

/// Whitespace-collapsed text of an element.
fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Image URL of an `img` element: `src` when it is absolute, else `data-src`
/// (lazy-loaded images keep a placeholder in `src`).
fn image_src(img: ElementRef<'_>, base: &Url) -> Option<String> {
    let attrs = img.value();
    let src = attrs.attr("src").filter(|s| s.starts_with("http"));
    let raw = src.or_else(|| attrs.attr("data-src")).filter(|s| !s.trim().is_empty())?;
    base.join(raw.trim()).ok().map(|u| u.to_string())
}

/// Parse a publisher timestamp in its local time zone into UTC.
///
/// Formats that carry their own offset (`%z`) are honored as-is.
fn parse_published(raw: &str, format: &str, utc_offset_hours: i32) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_str(raw, format) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, format).ok()?;
    let offset = FixedOffset::east_opt(utc_offset_hours * 3600)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}
