//! Read side of the corpus: recommendations, search and listings.
//!
//! [`QueryService`] keeps the primary store and the neighbor graph in memory.
//! The graph is swapped wholesale by [`QueryService::reload`], e.g. after an
//! offline index rebuild. Neighbor ids that have no committed article yet
//! (an ingestion cycle between index and commit) are skipped.

use crate::ann::NeighborGraph;
use crate::error::{PipelineError, QueryError};
use crate::models::{Article, ArticleRecommendation, LATEST_CATEGORY, ShortArticle};
use crate::store::Workspace;
use itertools::Itertools;
use regex::RegexBuilder;
use serde::Serialize;
use std::ops::RangeInclusive;
use tracing::{info, instrument, warn};

pub const RECOMMEND_LIMIT: RangeInclusive<usize> = 5..=20;
pub const DEFAULT_RECOMMEND_LIMIT: usize = 10;
pub const PAGE_RANGE: RangeInclusive<usize> = 1..=20;
pub const PAGE_LIMIT: RangeInclusive<usize> = 10..=40;
pub const DEFAULT_PAGE_LIMIT: usize = 20;

/// Row counts after a graph (re)load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GraphStatus {
    pub graph_rows: usize,
    pub articles: usize,
}

/// In-memory query layer over one data directory.
#[derive(Debug)]
pub struct QueryService {
    workspace: Workspace,
    default_k: usize,
    articles: Vec<Article>,
    graph: NeighborGraph,
}

impl QueryService {
    /// Load the primary store and the neighbor graph.
    pub async fn load(workspace: Workspace, default_k: usize) -> Result<Self, QueryError> {
        let mut service = Self {
            workspace,
            default_k,
            articles: Vec::new(),
            graph: NeighborGraph::default(),
        };
        service.reload().await?;
        Ok(service)
    }

    /// Re-read the primary store and swap in the on-disk neighbor graph.
    ///
    /// # Errors
    ///
    /// [`PipelineError::ConsistencyViolation`] when the graph references ids
    /// outside itself; the previous graph stays in place.
    #[instrument(level = "info", skip_all)]
    pub async fn reload(&mut self) -> Result<GraphStatus, QueryError> {
        let articles = self.workspace.primary().load().await?;
        let graph = self.workspace.index_files().load_graph(self.default_k).await?;
        graph.validate().map_err(PipelineError::ConsistencyViolation)?;

        if graph.row_count() != articles.len() {
            warn!(
                graph_rows = graph.row_count(),
                articles = articles.len(),
                "Neighbor graph and primary store differ; an ingestion cycle may be in progress"
            );
        }
        self.articles = articles;
        self.graph = graph;
        let status = GraphStatus {
            graph_rows: self.graph.row_count(),
            articles: self.articles.len(),
        };
        info!(rows = status.graph_rows, articles = status.articles, "Loaded neighbor graph");
        Ok(status)
    }

    pub fn article(&self, index: u32) -> Result<&Article, QueryError> {
        self.articles.get(index as usize).ok_or(QueryError::NotFound(index))
    }

    /// The first `limit` neighbors of article `index`, as short articles.
    ///
    /// # Errors
    ///
    /// [`QueryError::InvalidArgument`] for a limit outside `5..=20`,
    /// [`QueryError::NotFound`] for an unknown index.
    pub fn recommend(
        &self,
        index: u32,
        limit: Option<usize>,
    ) -> Result<Vec<ShortArticle>, QueryError> {
        let limit = bounded("limit", limit.unwrap_or(DEFAULT_RECOMMEND_LIMIT), &RECOMMEND_LIMIT)?;
        self.article(index)?;
        let Some(neighbors) = self.graph.neighbors(index, limit) else {
            warn!(index, "Article has no neighbor row yet");
            return Ok(Vec::new());
        };
        Ok(neighbors
            .iter()
            .filter(|&&id| id != index)
            .filter_map(|&id| self.articles.get(id as usize))
            .map(ShortArticle::from)
            .collect())
    }

    pub fn article_with_recommendations(
        &self,
        index: u32,
        limit: Option<usize>,
    ) -> Result<ArticleRecommendation, QueryError> {
        let recommendations = self.recommend(index, limit)?;
        Ok(ArticleRecommendation {
            article: self.article(index)?.clone(),
            recommendations,
        })
    }

    /// Case-insensitive substring search over titles and descriptions,
    /// newest first.
    pub fn search(
        &self,
        keyword: &str,
        page: Option<usize>,
        limit: Option<usize>,
    ) -> Result<Vec<ShortArticle>, QueryError> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(QueryError::InvalidArgument("keyword must not be empty".to_string()));
        }
        let pattern = RegexBuilder::new(&regex::escape(keyword))
            .case_insensitive(true)
            .build()
            .map_err(|e| QueryError::InvalidArgument(e.to_string()))?;
        let (skip, take) = page_window(page, limit)?;
        Ok(newest_first(
            self.articles
                .iter()
                .filter(|a| pattern.is_match(&a.title) || pattern.is_match(&a.description)),
        )
        .skip(skip)
        .take(take)
        .map(ShortArticle::from)
        .collect())
    }

    /// Articles of one category (or every category for `latest`), newest first.
    pub fn list(
        &self,
        category: Option<&str>,
        page: Option<usize>,
        limit: Option<usize>,
    ) -> Result<Vec<ShortArticle>, QueryError> {
        let category = category.unwrap_or(LATEST_CATEGORY);
        let (skip, take) = page_window(page, limit)?;
        Ok(newest_first(
            self.articles
                .iter()
                .filter(|a| category == LATEST_CATEGORY || a.category == category),
        )
        .skip(skip)
        .take(take)
        .map(ShortArticle::from)
        .collect())
    }
}

fn newest_first<'a>(
    articles: impl Iterator<Item = &'a Article>,
) -> impl Iterator<Item = &'a Article> {
    articles.sorted_by(|a, b| {
        b.published_at
            .cmp(&a.published_at)
            .then(b.dense_index.cmp(&a.dense_index))
    })
}

fn bounded(name: &str, value: usize, range: &RangeInclusive<usize>) -> Result<usize, QueryError> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(QueryError::InvalidArgument(format!(
            "{name} must be within {}..={}, got {value}",
            range.start(),
            range.end()
        )))
    }
}

/// `(skip, take)` for a 1-based page.
fn page_window(page: Option<usize>, limit: Option<usize>) -> Result<(usize, usize), QueryError> {
    let page = bounded("page", page.unwrap_or(1), &PAGE_RANGE)?;
    let limit = bounded("limit", limit.unwrap_or(DEFAULT_PAGE_LIMIT), &PAGE_LIMIT)?;
    Ok(((page - 1) * limit, limit))
}
