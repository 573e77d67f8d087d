//! File-backed persistence for the corpus and its derived artifacts.
//!
//! # Layout
//!
//! ```text
//! data_dir/
//! ├── articles.jsonl        # primary store, ordered by dense index
//! ├── staging.jsonl         # fetched, not yet committed
//! ├── blacklist.jsonl       # permanent exclusion ledger
//! ├── processed_titles.json # title cache aligned with dense indices
//! ├── neighbor_graph.json   # rows of neighbor ids, read by queries
//! ├── ann_index.json        # vectors + scored lists, read by ingestion
//! └── ingest.lock           # advisory lock held while a cycle runs
//! ```
//!
//! Each artifact is replaced as a unit, so stages can be interrupted between
//! writes without leaving a torn file.

pub mod collection;
pub mod lock;

pub use collection::{JsonlCollection, read_optional, write_atomic};
pub use lock::IngestLock;

use crate::ann::{AnnIndex, NeighborGraph};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Article, BlacklistEntry, StagedArticle};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

/// Paths of every persisted artifact under one data directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn primary(&self) -> PrimaryStore {
        PrimaryStore {
            docs: JsonlCollection::new(self.root.join("articles.jsonl")),
        }
    }

    pub fn staging(&self) -> JsonlCollection<StagedArticle> {
        JsonlCollection::new(self.root.join("staging.jsonl"))
    }

    pub fn blacklist(&self) -> BlacklistLedger {
        BlacklistLedger {
            docs: JsonlCollection::new(self.root.join("blacklist.jsonl")),
        }
    }

    pub fn titles(&self) -> TitleCache {
        TitleCache {
            path: self.root.join("processed_titles.json"),
        }
    }

    pub fn index_files(&self) -> IndexFiles {
        IndexFiles {
            graph: self.root.join("neighbor_graph.json"),
            index: self.root.join("ann_index.json"),
        }
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join("ingest.lock")
    }
}

/// Committed articles, unique on `(source, uri)` and ordered by dense index.
#[derive(Debug, Clone)]
pub struct PrimaryStore {
    docs: JsonlCollection<Article>,
}

impl PrimaryStore {
    /// All articles; article `i` has dense index `i`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::ConsistencyViolation`] if dense indices are not the
    /// contiguous range `0..len`.
    pub async fn load(&self) -> PipelineResult<Vec<Article>> {
        let articles = self.docs.load().await?;
        for (i, article) in articles.iter().enumerate() {
            if article.dense_index != Some(i as u32) {
                return Err(PipelineError::ConsistencyViolation(format!(
                    "article at position {i} ({}) has dense index {:?}",
                    article.uri, article.dense_index
                )));
            }
        }
        Ok(articles)
    }

    pub async fn count(&self) -> PipelineResult<usize> {
        self.docs.count().await
    }

    /// Append a batch in one atomic write.
    ///
    /// The batch must carry dense indices continuing the current range and
    /// must not repeat a `(source, uri)` key.
    #[instrument(level = "info", skip_all, fields(batch = batch.len()))]
    pub async fn insert_many(&self, batch: Vec<Article>) -> PipelineResult<()> {
        let mut all = self.load().await?;
        let mut keys: HashSet<(String, String)> =
            all.iter().map(|a| (a.source.clone(), a.uri.clone())).collect();
        for (offset, article) in batch.iter().enumerate() {
            let expected = (all.len() + offset) as u32;
            if article.dense_index != Some(expected) {
                return Err(PipelineError::ConsistencyViolation(format!(
                    "commit batch article {} has dense index {:?}, expected {expected}",
                    article.uri, article.dense_index
                )));
            }
            if !keys.insert((article.source.clone(), article.uri.clone())) {
                return Err(PipelineError::DuplicateKey {
                    publisher: article.source.clone(),
                    uri: article.uri.clone(),
                });
            }
        }
        all.extend(batch);
        self.docs.replace(&all).await?;
        info!(total = all.len(), "Primary store updated");
        Ok(())
    }
}

/// Append-only ledger of permanently excluded URIs.
#[derive(Debug, Clone)]
pub struct BlacklistLedger {
    docs: JsonlCollection<BlacklistEntry>,
}

impl BlacklistLedger {
    pub async fn load(&self) -> PipelineResult<Vec<BlacklistEntry>> {
        self.docs.load().await
    }

    /// `(source, uri)` keys currently on the ledger.
    pub async fn keys(&self) -> PipelineResult<HashSet<(String, String)>> {
        Ok(self.load().await?.iter().map(BlacklistEntry::key).collect())
    }

    pub async fn count(&self) -> PipelineResult<usize> {
        self.docs.count().await
    }

    /// Append entries whose key is not yet on the ledger. Returns how many
    /// were added.
    pub async fn append_unique(&self, entries: Vec<BlacklistEntry>) -> PipelineResult<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut all = self.load().await?;
        let mut keys: HashSet<(String, String)> = all.iter().map(BlacklistEntry::key).collect();
        let before = all.len();
        for entry in entries {
            if keys.insert(entry.key()) {
                all.push(entry);
            }
        }
        let added = all.len() - before;
        if added > 0 {
            self.docs.replace(&all).await?;
        }
        Ok(added)
    }
}

/// Normalized titles aligned 1:1 with dense indices, saved as one unit.
#[derive(Debug, Clone)]
pub struct TitleCache {
    path: PathBuf,
}

impl TitleCache {
    pub async fn load(&self) -> PipelineResult<Vec<String>> {
        match read_optional(&self.path).await? {
            Some(raw) => {
                serde_json::from_str(&raw).map_err(|e| PipelineError::decode(&self.path, e))
            }
            None => Ok(Vec::new()),
        }
    }

    pub async fn save(&self, titles: &[String]) -> PipelineResult<()> {
        let json = serde_json::to_vec(titles).map_err(|e| PipelineError::decode(&self.path, e))?;
        write_atomic(&self.path, &json).await
    }
}

/// The neighbor graph and the index state behind it.
///
/// They are written index-first: the graph's row count is what later stages
/// read as "index updated", so it must never run ahead of the index.
#[derive(Debug, Clone)]
pub struct IndexFiles {
    graph: PathBuf,
    index: PathBuf,
}

impl IndexFiles {
    /// The graph, or an empty one with `default_k` if none was saved yet.
    pub async fn load_graph(&self, default_k: usize) -> PipelineResult<NeighborGraph> {
        match read_optional(&self.graph).await? {
            Some(raw) => {
                serde_json::from_str(&raw).map_err(|e| PipelineError::decode(&self.graph, e))
            }
            None => Ok(NeighborGraph::new(default_k, Vec::new())),
        }
    }

    pub async fn load_index(&self) -> PipelineResult<Option<AnnIndex>> {
        match read_optional(&self.index).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| PipelineError::decode(&self.index, e)),
            None => Ok(None),
        }
    }

    /// Persist the index, then the graph projected from it.
    pub async fn save(&self, index: &AnnIndex) -> PipelineResult<()> {
        let index_json =
            serde_json::to_vec(index).map_err(|e| PipelineError::decode(&self.index, e))?;
        write_atomic(&self.index, &index_json).await?;
        self.save_graph(&index.graph()).await
    }

    pub async fn save_graph(&self, graph: &NeighborGraph) -> PipelineResult<()> {
        let graph_json =
            serde_json::to_vec(graph).map_err(|e| PipelineError::decode(&self.graph, e))?;
        write_atomic(&self.graph, &graph_json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnnConfig;
    use crate::models::fixtures::staged;

    #[tokio::test]
    async fn test_insert_many_enforces_contiguous_indices() {
        let dir = tempfile::tempdir().unwrap();
        let primary = Workspace::new(dir.path()).primary();

        primary
            .insert_many(vec![
                staged("a", "https://a/1", "One", 1).into_article(0),
                staged("a", "https://a/2", "Two", 2).into_article(1),
            ])
            .await
            .unwrap();

        let gap = primary
            .insert_many(vec![staged("a", "https://a/3", "Three", 3).into_article(5)])
            .await;
        assert!(matches!(gap, Err(PipelineError::ConsistencyViolation(_))));
        assert_eq!(primary.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_insert_many_rejects_duplicate_key() {
        let dir = tempfile::tempdir().unwrap();
        let primary = Workspace::new(dir.path()).primary();
        primary
            .insert_many(vec![staged("a", "https://a/1", "One", 1).into_article(0)])
            .await
            .unwrap();

        let dup = primary
            .insert_many(vec![staged("a", "https://a/1", "One again", 2).into_article(1)])
            .await;
        assert!(matches!(dup, Err(PipelineError::DuplicateKey { .. })));
    }

    #[tokio::test]
    async fn test_blacklist_append_unique() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Workspace::new(dir.path()).blacklist();

        let added = ledger
            .append_unique(vec![
                BlacklistEntry::structural("a", "https://a/1"),
                BlacklistEntry::duplicate("a", "https://a/1"),
                BlacklistEntry::duplicate("b", "https://a/1"),
            ])
            .await
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(
            ledger
                .append_unique(vec![BlacklistEntry::structural("a", "https://a/1")])
                .await
                .unwrap(),
            0
        );
        assert_eq!(ledger.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_title_cache_round_trip_and_default() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Workspace::new(dir.path()).titles();
        assert!(cache.load().await.unwrap().is_empty());

        cache.save(&["bão số".to_string(), "giá vàng".to_string()]).await.unwrap();
        assert_eq!(cache.load().await.unwrap(), vec!["bão số", "giá vàng"]);
    }

    #[tokio::test]
    async fn test_index_files_save_graph_projection() {
        let dir = tempfile::tempdir().unwrap();
        let files = Workspace::new(dir.path()).index_files();
        assert_eq!(files.load_graph(5).await.unwrap().row_count(), 0);
        assert!(files.load_index().await.unwrap().is_none());

        let index = AnnIndex::build(
            vec![vec![1.0, 0.0], vec![0.9, 0.1], vec![0.0, 1.0]],
            &AnnConfig {
                neighbors: 2,
                ..AnnConfig::default()
            },
        );
        files.save(&index).await.unwrap();

        let graph = files.load_graph(5).await.unwrap();
        assert_eq!(graph, index.graph());
        assert_eq!(files.load_index().await.unwrap().unwrap().len(), 3);
    }
}
