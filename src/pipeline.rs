//! The ingestion cycle: fetch → dedup → index → commit.
//!
//! There is no persisted "current stage" flag. The state is derived from the
//! sizes of the persisted artifacts every time, so a cycle interrupted at any
//! point resumes by running again from the top:
//!
//! | State       | Staging            | Title cache | Graph rows | Next step     |
//! |-------------|--------------------|-------------|------------|---------------|
//! | `Empty`     | empty              | = primary   | = primary  | fetch         |
//! | `Fetched`   | new articles       | = primary   | = primary  | dedup         |
//! | `Deduped`   | survivors          | > primary   | = primary  | index         |
//! | `Indexed`   | survivors          | > primary   | = cache    | commit        |
//! | `Committed` | already in primary | = primary   | = primary  | clear staging |
//!
//! Anything else is a [`PipelineError::ConsistencyViolation`] and halts the
//! cycle.
//!
//! # Write order
//!
//! Within a stage, artifacts are written so that the one checked by the state
//! derivation goes last:
//!
//! - dedup: blacklist, then staging (survivors), then the title cache
//! - index: index state, then the neighbor graph
//! - commit: primary store, then clearing staging

use crate::ann::AnnIndex;
use crate::config::Config;
use crate::dedup::Deduplicator;
use crate::error::{PipelineError, PipelineResult};
use crate::fetch::{self, FetchAdapter};
use crate::models::StagedArticle;
use crate::store::{IngestLock, Workspace};
use crate::text::TextNormalizer;
use crate::vectorize::{TopicVectorizer, vectorize_batch};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Position of the pipeline within an ingestion cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Empty,
    Fetched,
    Deduped,
    Indexed,
    /// The batch reached the primary store but staging was not cleared.
    Committed,
}

/// Sizes of the persisted artifacts, the input to state derivation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub primary: usize,
    pub titles: usize,
    pub graph_rows: usize,
    pub staged: usize,
    /// Staged `(source, uri)` keys already present in the primary store.
    pub staged_committed: usize,
    pub blacklisted: usize,
}

impl StoreCounts {
    /// Derive the pipeline state.
    ///
    /// # Errors
    ///
    /// [`PipelineError::ConsistencyViolation`] for combinations no sequence of
    /// interrupted stages can produce.
    pub fn state(&self) -> PipelineResult<PipelineState> {
        let violation = |what: &str| {
            Err(PipelineError::ConsistencyViolation(format!(
                "{what} (primary={}, titles={}, graph={}, staged={}, staged_committed={})",
                self.primary, self.titles, self.graph_rows, self.staged, self.staged_committed
            )))
        };
        let quiescent = self.titles == self.primary && self.graph_rows == self.primary;

        if self.staged == 0 {
            return if quiescent {
                Ok(PipelineState::Empty)
            } else {
                violation("stores diverge with empty staging")
            };
        }
        if self.staged_committed == self.staged {
            return if quiescent {
                Ok(PipelineState::Committed)
            } else {
                violation("committed batch left stores diverged")
            };
        }
        if self.staged_committed > 0 {
            return violation("staging partially overlaps the primary store");
        }
        if self.titles == self.primary {
            return if self.graph_rows == self.primary {
                Ok(PipelineState::Fetched)
            } else {
                violation("graph rows differ from primary before dedup")
            };
        }
        if self.titles < self.primary {
            return violation("title cache is shorter than the primary store");
        }
        if self.titles - self.primary != self.staged {
            return violation("title cache growth does not match staged survivors");
        }
        if self.graph_rows == self.primary {
            Ok(PipelineState::Deduped)
        } else if self.graph_rows == self.titles {
            Ok(PipelineState::Indexed)
        } else {
            violation("graph rows match neither primary nor title cache")
        }
    }
}

/// Read the artifact sizes of `workspace`.
pub async fn store_counts(workspace: &Workspace, default_k: usize) -> PipelineResult<StoreCounts> {
    let primary = workspace.primary().load().await?;
    let staged = workspace.staging().load().await?;
    let keys: HashSet<(&str, &str)> = primary
        .iter()
        .map(|a| (a.source.as_str(), a.uri.as_str()))
        .collect();
    Ok(StoreCounts {
        primary: primary.len(),
        titles: workspace.titles().load().await?.len(),
        graph_rows: workspace.index_files().load_graph(default_k).await?.row_count(),
        staged: staged.len(),
        staged_committed: staged
            .iter()
            .filter(|a| keys.contains(&(a.source.as_str(), a.uri.as_str())))
            .count(),
        blacklisted: workspace.blacklist().count().await?,
    })
}

/// What one ingestion cycle did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    /// State found when the cycle started.
    pub resumed_from: Option<PipelineState>,
    pub fetched: usize,
    pub blacklisted_structural: usize,
    pub transient_failures: usize,
    pub duplicates: usize,
    pub indexed: usize,
    pub revised_rows: usize,
    pub committed: usize,
    pub total_articles: usize,
}

/// The ingestion pipeline over one data directory.
pub struct Pipeline {
    workspace: Workspace,
    config: Config,
    normalizer: TextNormalizer,
    vectorizer: Arc<dyn TopicVectorizer>,
    adapters: Vec<Arc<dyn FetchAdapter>>,
}

impl Pipeline {
    pub fn new(
        workspace: Workspace,
        config: Config,
        normalizer: TextNormalizer,
        vectorizer: Arc<dyn TopicVectorizer>,
        adapters: Vec<Arc<dyn FetchAdapter>>,
    ) -> Self {
        Self {
            workspace,
            config,
            normalizer,
            vectorizer,
            adapters,
        }
    }

    pub async fn state(&self) -> PipelineResult<PipelineState> {
        store_counts(&self.workspace, self.config.ann.neighbors).await?.state()
    }

    /// Run one ingestion cycle under the ingestion lock.
    ///
    /// A cycle handles one batch: an interrupted batch is finished instead of
    /// fetching a new one.
    ///
    /// # Errors
    ///
    /// Any stage failure aborts the cycle, leaving the stores in the shape
    /// the failing stage found them.
    #[instrument(level = "info", skip_all, fields(data_dir = %self.workspace.root().display()))]
    pub async fn run_cycle(&self) -> PipelineResult<CycleReport> {
        tokio::fs::create_dir_all(self.workspace.root())
            .await
            .map_err(|e| PipelineError::io(self.workspace.root(), e))?;
        let _lock = IngestLock::acquire(&self.workspace.lock_path())?;

        let mut report = CycleReport::default();
        // one batch per cycle: a resumed batch is finished without a new fetch
        let mut batch_started = false;
        let mut previous = None;
        loop {
            let state = self.state().await?;
            if report.resumed_from.is_none() {
                report.resumed_from = Some(state);
                if state != PipelineState::Empty {
                    info!(?state, "Staging already populated; skipping fetch and resuming");
                    batch_started = true;
                }
            }
            if previous == Some(state) && !(state == PipelineState::Empty && batch_started) {
                return Err(PipelineError::ConsistencyViolation(format!(
                    "stage for state {state:?} did not advance"
                )));
            }
            previous = Some(state);

            match state {
                PipelineState::Empty if batch_started => break,
                PipelineState::Empty => {
                    let (staged, structural, transient) = self.fetch_stage().await?;
                    report.fetched = staged;
                    report.blacklisted_structural = structural;
                    report.transient_failures = transient;
                    batch_started = true;
                }
                PipelineState::Fetched => report.duplicates = self.dedup_stage().await?,
                PipelineState::Deduped => {
                    let (indexed, revised) = self.index_stage().await?;
                    report.indexed = indexed;
                    report.revised_rows = revised;
                }
                PipelineState::Indexed => report.committed = self.commit_stage().await?,
                PipelineState::Committed => self.clear_committed_staging().await?,
            }
        }

        report.total_articles = self.workspace.primary().count().await?;
        info!(
            committed = report.committed,
            duplicates = report.duplicates,
            total = report.total_articles,
            "Ingestion cycle complete"
        );
        Ok(report)
    }

    /// Fetch new articles into empty staging.
    ///
    /// Returns `(staged, structural failures, transient failures)`.
    #[instrument(level = "info", skip_all)]
    pub(crate) async fn fetch_stage(&self) -> PipelineResult<(usize, usize, usize)> {
        let staging = self.workspace.staging();
        if !staging.is_empty().await? {
            info!("Already fetched; not re-fetching");
            return Ok((0, 0, 0));
        }
        let blacklist = self.workspace.blacklist();
        let mut known = blacklist.keys().await?;
        known.extend(
            self.workspace
                .primary()
                .load()
                .await?
                .into_iter()
                .map(|a| (a.source, a.uri)),
        );

        let report = fetch::collect(&self.adapters, known, &self.config.fetch).await;
        let structural = blacklist.append_unique(report.blacklist).await?;
        staging.replace(&report.staged).await?;
        info!(staged = report.staged.len(), structural, "Staged fetched articles");
        Ok((report.staged.len(), structural, report.transient))
    }

    /// Remove near-duplicates from staging and extend the title cache.
    ///
    /// Returns the number of discarded articles.
    #[instrument(level = "info", skip_all)]
    pub(crate) async fn dedup_stage(&self) -> PipelineResult<usize> {
        let primary = self.workspace.primary().load().await?;
        let titles_cache = self.workspace.titles();
        let old_titles = titles_cache.load().await?;
        if old_titles.len() > primary.len() {
            info!("Titles already checked for this batch; skipping dedup");
            return Ok(0);
        }
        let staged = self.workspace.staging().load().await?;
        let old_published: Vec<_> = primary.iter().map(|a| a.published_at).collect();

        let deduplicator = Deduplicator::new(
            &self.normalizer,
            &self.config.dedup,
            self.config.text.min_token_chars,
        );
        let outcome = deduplicator.detect(&old_titles, &old_published, &staged)?;
        let survivors: Vec<StagedArticle> =
            outcome.survivors(&staged).into_iter().cloned().collect();

        self.workspace.blacklist().append_unique(outcome.blacklist.clone()).await?;
        self.workspace.staging().replace(&survivors).await?;
        titles_cache.save(&outcome.titles).await?;

        info!(
            discarded = outcome.discarded.len(),
            survivors = survivors.len(),
            "Deduplicated staged articles"
        );
        Ok(outcome.discarded.len())
    }

    /// Vectorize staged survivors and insert them into the neighbor index.
    ///
    /// Returns `(inserted rows, revised existing rows)`.
    #[instrument(level = "info", skip_all)]
    pub(crate) async fn index_stage(&self) -> PipelineResult<(usize, usize)> {
        let ann = &self.config.ann;
        let files = self.workspace.index_files();
        let primary_len = self.workspace.primary().count().await?;
        let title_len = self.workspace.titles().load().await?.len();
        if files.load_graph(ann.neighbors).await?.row_count() == title_len {
            info!("Index already updated for this batch");
            return Ok((0, 0));
        }
        let staged = self.workspace.staging().load().await?;

        let mut index = match files.load_index().await? {
            Some(index) => index,
            None if primary_len == 0 => AnnIndex::new(ann.metric, ann.neighbors),
            None => {
                return Err(PipelineError::ConsistencyViolation(format!(
                    "index state is missing for {primary_len} committed articles; run rebuild-index"
                )));
            }
        };
        index.check_config(ann);

        if index.len() == primary_len + staged.len() {
            warn!("Index state already includes this batch; re-exporting graph");
            files.save_graph(&index.graph()).await?;
            return Ok((staged.len(), 0));
        }
        if index.len() != primary_len {
            return Err(PipelineError::ConsistencyViolation(format!(
                "index state has {} rows, expected {primary_len} or {}",
                index.len(),
                primary_len + staged.len()
            )));
        }

        let refs: Vec<&StagedArticle> = staged.iter().collect();
        let vectors = vectorize_batch(self.vectorizer.as_ref(), &self.normalizer, &refs)?;
        if let (Some(dim), Some(first)) = (index.dimension(), vectors.first()) {
            if dim != first.len() {
                return Err(PipelineError::Vectorizer(format!(
                    "topic vectors have {} components but the index holds {dim}",
                    first.len()
                )));
            }
        }
        let revised = index.insert_batch(vectors, ann);
        files.save(&index).await?;
        info!(rows = index.len(), revised = revised.len(), "Neighbor graph updated");
        Ok((staged.len(), revised.len()))
    }

    /// Move staged survivors into the primary store with their final indices.
    ///
    /// Returns the number of committed articles.
    #[instrument(level = "info", skip_all)]
    pub(crate) async fn commit_stage(&self) -> PipelineResult<usize> {
        let staging = self.workspace.staging();
        let staged = staging.load().await?;
        if staged.is_empty() {
            info!("Nothing to commit");
            return Ok(0);
        }
        let primary = self.workspace.primary();
        let base = primary.count().await?;
        let batch: Vec<_> = staged
            .into_iter()
            .enumerate()
            .map(|(i, article)| article.into_article((base + i) as u32))
            .collect();
        let committed = batch.len();

        primary.insert_many(batch).await?;
        staging.clear().await?;
        info!(first = base, committed, "Committed staged articles");
        Ok(committed)
    }

    async fn clear_committed_staging(&self) -> PipelineResult<()> {
        info!("Batch already committed; clearing staging");
        self.workspace.staging().clear().await
    }

    /// Rebuild the index and graph from scratch over the whole corpus.
    ///
    /// Reuses the persisted vectors when they cover the corpus, otherwise
    /// re-vectorizes every committed article.
    #[instrument(level = "info", skip_all)]
    pub async fn rebuild_index(&self) -> PipelineResult<usize> {
        let _lock = IngestLock::acquire(&self.workspace.lock_path())?;
        let state = self.state().await?;
        if state != PipelineState::Empty {
            return Err(PipelineError::ConsistencyViolation(format!(
                "cannot rebuild while a cycle is in progress (state {state:?}); run ingest first"
            )));
        }

        let primary = self.workspace.primary().load().await?;
        let files = self.workspace.index_files();
        let vectors = match files.load_index().await? {
            Some(index) if index.len() == primary.len() => {
                info!("Reusing persisted topic vectors");
                index.vectors().to_vec()
            }
            _ => {
                info!(count = primary.len(), "Re-vectorizing corpus");
                let staged: Vec<StagedArticle> =
                    primary.into_iter().map(StagedArticle::from).collect();
                let refs: Vec<&StagedArticle> = staged.iter().collect();
                vectorize_batch(self.vectorizer.as_ref(), &self.normalizer, &refs)?
            }
        };

        let index = AnnIndex::build(vectors, &self.config.ann);
        files.save(&index).await?;
        info!(rows = index.len(), "Rebuilt neighbor index");
        Ok(index.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchFailure;
    use crate::fetch::collector::stub::StubAdapter;
    use crate::models::BlacklistReason;
    use chrono::{DateTime, TimeZone, Utc};

    const STORM: &str = "heavy storm hits northern coast provinces forcing mass evacuation tonight";
    const STORM_AGAIN: &str = "heavy storm hits northern coast provinces forcing mass evacuation";
    const GOLD: &str = "gold price rises sharply";

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 23, hour, 0, 0).unwrap()
    }

    /// Deterministic topic vectors: token counts bucketed by first byte.
    struct BucketVectorizer;

    impl TopicVectorizer for BucketVectorizer {
        fn num_topics(&self) -> usize {
            4
        }

        fn vectorize(&self, tokens: &[String]) -> PipelineResult<Vec<f32>> {
            let mut v = vec![1.0f32; 4];
            for token in tokens {
                v[token.as_bytes()[0] as usize % 4] += 1.0;
            }
            let total: f32 = v.iter().sum();
            Ok(v.into_iter().map(|x| x / total).collect())
        }
    }

    struct UnavailableVectorizer;

    impl TopicVectorizer for UnavailableVectorizer {
        fn num_topics(&self) -> usize {
            4
        }

        fn vectorize(&self, _tokens: &[String]) -> PipelineResult<Vec<f32>> {
            Err(PipelineError::Vectorizer("model not loaded".to_string()))
        }
    }

    fn pipeline_with(
        dir: &std::path::Path,
        adapter: StubAdapter,
        vectorizer: Arc<dyn TopicVectorizer>,
    ) -> Pipeline {
        let mut config = Config::default();
        config.ann.neighbors = 3;
        Pipeline::new(
            Workspace::new(dir),
            config,
            TextNormalizer::with_stop_words(Vec::<String>::new()),
            vectorizer,
            vec![Arc::new(adapter)],
        )
    }

    fn pipeline(dir: &std::path::Path, adapter: StubAdapter) -> Pipeline {
        pipeline_with(dir, adapter, Arc::new(BucketVectorizer))
    }

    fn storm_source() -> StubAdapter {
        StubAdapter::new("dantri")
            .category("thoi-su", "thoi-su", &["https://d/1", "https://d/2", "https://d/3"])
            .page("https://d/1", STORM, at(8))
            .page("https://d/2", STORM_AGAIN, at(10))
            .page("https://d/3", GOLD, at(9))
    }

    async fn assert_quiescent(dir: &std::path::Path) -> StoreCounts {
        let counts = store_counts(&Workspace::new(dir), 3).await.unwrap();
        assert_eq!(counts.state().unwrap(), PipelineState::Empty);
        assert_eq!(counts.titles, counts.primary);
        assert_eq!(counts.graph_rows, counts.primary);
        counts
    }

    #[test]
    fn test_state_derivation() {
        let counts = |primary, titles, graph_rows, staged, staged_committed| StoreCounts {
            primary,
            titles,
            graph_rows,
            staged,
            staged_committed,
            blacklisted: 0,
        };
        assert_eq!(counts(4, 4, 4, 0, 0).state().unwrap(), PipelineState::Empty);
        assert_eq!(counts(4, 4, 4, 3, 0).state().unwrap(), PipelineState::Fetched);
        assert_eq!(counts(4, 6, 4, 2, 0).state().unwrap(), PipelineState::Deduped);
        assert_eq!(counts(4, 6, 6, 2, 0).state().unwrap(), PipelineState::Indexed);
        assert_eq!(counts(6, 6, 6, 2, 2).state().unwrap(), PipelineState::Committed);

        for broken in [
            counts(4, 5, 4, 0, 0),
            counts(4, 4, 3, 2, 0),
            counts(4, 3, 4, 2, 0),
            counts(4, 6, 4, 3, 0),
            counts(4, 6, 5, 2, 0),
            counts(6, 6, 6, 2, 1),
        ] {
            assert!(
                matches!(broken.state(), Err(PipelineError::ConsistencyViolation(_))),
                "{broken:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_cycle_discards_near_duplicate_and_grows_graph() {
        let dir = tempfile::tempdir().unwrap();
        let report = pipeline(dir.path(), storm_source()).run_cycle().await.unwrap();

        assert_eq!(report.resumed_from, Some(PipelineState::Empty));
        assert_eq!(report.fetched, 3);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.committed, 2);

        let counts = assert_quiescent(dir.path()).await;
        assert_eq!(counts.primary, 2);
        assert_eq!(counts.graph_rows, 2);

        let ledger = Workspace::new(dir.path()).blacklist().load().await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].uri, "https://d/2");
        assert_eq!(ledger[0].reason, BlacklistReason::Duplicate);

        let articles = Workspace::new(dir.path()).primary().load().await.unwrap();
        let uris: Vec<_> = articles.iter().map(|a| a.uri.as_str()).collect();
        assert_eq!(uris, vec!["https://d/1", "https://d/3"]);
    }

    #[tokio::test]
    async fn test_second_cycle_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path(), storm_source());
        pipeline.run_cycle().await.unwrap();
        let before = assert_quiescent(dir.path()).await;

        let report = pipeline.run_cycle().await.unwrap();
        assert_eq!(report.fetched, 0);
        assert_eq!(report.committed, 0);

        let after = assert_quiescent(dir.path()).await;
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_identical_titles_far_apart_are_both_committed() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = StubAdapter::new("vnexpress")
            .category("thoi-su", "thoi-su", &["https://v/1", "https://v/2"])
            .page("https://v/1", STORM, at(1))
            .page("https://v/2", STORM, at(11));

        let report = pipeline(dir.path(), adapter).run_cycle().await.unwrap();
        assert_eq!(report.duplicates, 0);
        assert_eq!(report.committed, 2);
        assert_eq!(assert_quiescent(dir.path()).await.blacklisted, 0);
    }

    #[tokio::test]
    async fn test_new_article_matching_corpus_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let first = StubAdapter::new("dantri")
            .category("thoi-su", "thoi-su", &["https://d/1", "https://d/3"])
            .page("https://d/1", STORM, at(8))
            .page("https://d/3", GOLD, at(9));
        pipeline(dir.path(), first).run_cycle().await.unwrap();

        let second = StubAdapter::new("vnexpress")
            .category("thoi-su", "thoi-su", &["https://v/9"])
            .page("https://v/9", STORM_AGAIN, at(9));
        let report = pipeline(dir.path(), second).run_cycle().await.unwrap();

        assert_eq!(report.duplicates, 1);
        assert_eq!(report.committed, 0);
        let counts = assert_quiescent(dir.path()).await;
        assert_eq!(counts.primary, 2);
        assert_eq!(counts.blacklisted, 1);
    }

    #[tokio::test]
    async fn test_resume_after_crash_between_dedup_and_commit() {
        let dir = tempfile::tempdir().unwrap();
        let seed = StubAdapter::new("dantri")
            .category("thoi-su", "thoi-su", &["https://d/3"])
            .page("https://d/3", GOLD, at(9));
        pipeline(dir.path(), seed).run_cycle().await.unwrap();

        let interrupted = pipeline(dir.path(), storm_source());
        interrupted.fetch_stage().await.unwrap();
        interrupted.dedup_stage().await.unwrap();
        assert_eq!(interrupted.state().await.unwrap(), PipelineState::Deduped);
        drop(interrupted);

        let report = pipeline(dir.path(), storm_source()).run_cycle().await.unwrap();
        assert_eq!(report.resumed_from, Some(PipelineState::Deduped));
        assert_eq!(report.fetched, 0);
        assert_eq!(report.committed, 1);

        let articles = Workspace::new(dir.path()).primary().load().await.unwrap();
        let indices: Vec<_> = articles.iter().map(|a| a.dense_index).collect();
        assert_eq!(indices, vec![Some(0), Some(1)]);
        assert_eq!(articles[1].uri, "https://d/1");
        assert_quiescent(dir.path()).await;
    }

    #[tokio::test]
    async fn test_resume_after_commit_before_staging_clear() {
        let dir = tempfile::tempdir().unwrap();
        let interrupted = pipeline(dir.path(), storm_source());
        interrupted.fetch_stage().await.unwrap();
        interrupted.dedup_stage().await.unwrap();
        interrupted.index_stage().await.unwrap();

        let workspace = Workspace::new(dir.path());
        let staged = workspace.staging().load().await.unwrap();
        let batch = staged
            .into_iter()
            .enumerate()
            .map(|(i, a)| a.into_article(i as u32))
            .collect();
        workspace.primary().insert_many(batch).await.unwrap();
        assert_eq!(interrupted.state().await.unwrap(), PipelineState::Committed);

        let report = interrupted.run_cycle().await.unwrap();
        assert_eq!(report.resumed_from, Some(PipelineState::Committed));
        assert_eq!(report.committed, 0);
        assert_eq!(report.total_articles, 2);
        assert_quiescent(dir.path()).await;
    }

    #[tokio::test]
    async fn test_index_stage_skips_when_graph_already_updated() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path(), storm_source());
        p.fetch_stage().await.unwrap();
        p.dedup_stage().await.unwrap();
        assert_eq!(p.index_stage().await.unwrap(), (2, 0));
        assert_eq!(p.index_stage().await.unwrap(), (0, 0));
        assert_eq!(p.state().await.unwrap(), PipelineState::Indexed);
    }

    #[tokio::test]
    async fn test_vectorizer_failure_aborts_before_index_changes() {
        let dir = tempfile::tempdir().unwrap();
        let broken = pipeline_with(dir.path(), storm_source(), Arc::new(UnavailableVectorizer));

        let err = broken.run_cycle().await.unwrap_err();
        assert!(matches!(err, PipelineError::Vectorizer(_)));
        assert_eq!(broken.state().await.unwrap(), PipelineState::Deduped);
        drop(IngestLock::acquire(&dir.path().join("ingest.lock")).unwrap());

        let report = pipeline(dir.path(), storm_source()).run_cycle().await.unwrap();
        assert_eq!(report.committed, 2);
        assert_quiescent(dir.path()).await;
    }

    #[tokio::test]
    async fn test_structural_failures_are_blacklisted_transient_retried() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = || {
            StubAdapter::new("dantri")
                .category("thoi-su", "thoi-su", &["https://d/1", "https://d/2", "https://d/3"])
                .page("https://d/1", GOLD, at(8))
                .failing(FetchFailure::structural("https://d/2", "NO CONTENT"))
                .failing(FetchFailure::transient("https://d/3", "timeout"))
        };

        let first = pipeline(dir.path(), adapter()).run_cycle().await.unwrap();
        assert_eq!(first.blacklisted_structural, 1);
        assert_eq!(first.transient_failures, 1);

        let second = pipeline(dir.path(), adapter()).run_cycle().await.unwrap();
        assert_eq!(second.blacklisted_structural, 0);
        assert_eq!(second.transient_failures, 1);
        assert_eq!(assert_quiescent(dir.path()).await.primary, 1);
    }

    #[tokio::test]
    async fn test_cycle_refuses_held_lock() {
        let dir = tempfile::tempdir().unwrap();
        let _held = IngestLock::acquire(&dir.path().join("ingest.lock")).unwrap();
        let err = pipeline(dir.path(), storm_source()).run_cycle().await.unwrap_err();
        assert!(matches!(err, PipelineError::LockHeld(_)));
    }

    /// Seed one committed article, then fetch and dedup a batch without
    /// indexing or committing it.
    async fn interrupted_after_dedup(dir: &std::path::Path) -> Pipeline {
        let seed = StubAdapter::new("dantri")
            .category("thoi-su", "thoi-su", &["https://d/3"])
            .page("https://d/3", GOLD, at(9));
        pipeline(dir, seed).run_cycle().await.unwrap();

        let interrupted = pipeline(dir, storm_source());
        interrupted.fetch_stage().await.unwrap();
        interrupted.dedup_stage().await.unwrap();
        assert_eq!(interrupted.state().await.unwrap(), PipelineState::Deduped);
        interrupted
    }

    #[tokio::test]
    async fn test_lock_file_left_by_killed_cycle_does_not_block_resume() {
        let dir = tempfile::tempdir().unwrap();
        drop(interrupted_after_dedup(dir.path()).await);
        std::fs::write(
            dir.path().join("ingest.lock"),
            "pid=4194303 started=2024-07-23T08:00:00+00:00\n",
        )
        .unwrap();

        let report = pipeline(dir.path(), storm_source()).run_cycle().await.unwrap();
        assert_eq!(report.resumed_from, Some(PipelineState::Deduped));
        assert_eq!(report.committed, 1);
        assert_eq!(assert_quiescent(dir.path()).await.primary, 2);
    }

    #[tokio::test]
    async fn test_resume_after_crash_between_index_and_graph_writes() {
        let dir = tempfile::tempdir().unwrap();
        let p = interrupted_after_dedup(dir.path()).await;
        let graph_path = dir.path().join("neighbor_graph.json");
        let old_graph = std::fs::read(&graph_path).unwrap();

        assert_eq!(p.index_stage().await.unwrap().0, 1);
        std::fs::write(&graph_path, old_graph).unwrap();
        assert_eq!(p.state().await.unwrap(), PipelineState::Deduped);

        let report = p.run_cycle().await.unwrap();
        assert_eq!(report.resumed_from, Some(PipelineState::Deduped));
        assert_eq!(report.indexed, 1);
        assert_eq!(report.revised_rows, 0);
        assert_eq!(report.committed, 1);
        let counts = assert_quiescent(dir.path()).await;
        assert_eq!(counts.graph_rows, 2);
    }

    #[tokio::test]
    async fn test_missing_index_state_halts_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let p = interrupted_after_dedup(dir.path()).await;
        std::fs::remove_file(dir.path().join("ann_index.json")).unwrap();

        let err = p.run_cycle().await.unwrap_err();
        assert!(matches!(err, PipelineError::ConsistencyViolation(_)), "{err}");
        assert_eq!(p.state().await.unwrap(), PipelineState::Deduped);
    }

    #[tokio::test]
    async fn test_rebuild_index_refuses_mid_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let p = interrupted_after_dedup(dir.path()).await;

        let err = p.rebuild_index().await.unwrap_err();
        assert!(matches!(err, PipelineError::ConsistencyViolation(_)), "{err}");
        assert_eq!(p.state().await.unwrap(), PipelineState::Deduped);
        assert_eq!(store_counts(&Workspace::new(dir.path()), 3).await.unwrap().graph_rows, 1);
    }

    #[tokio::test]
    async fn test_rebuild_index_matches_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path(), storm_source());
        p.run_cycle().await.unwrap();

        assert_eq!(p.rebuild_index().await.unwrap(), 2);
        assert_quiescent(dir.path()).await;

        std::fs::remove_file(dir.path().join("ann_index.json")).unwrap();
        assert_eq!(p.rebuild_index().await.unwrap(), 2);
        assert_quiescent(dir.path()).await;
    }
}
