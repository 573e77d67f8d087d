//! Near-duplicate detection between staged and committed articles.
//!
//! Independently crawled publishers often report the same event under nearly
//! the same headline. Two articles are duplicates when their normalized titles
//! are similar in one shared TF-IDF space **and** they were published within a
//! bounded time window of each other. Similar titles far apart in time (yearly
//! recaps, recycled photo-story templates) are kept.
//!
//! # Tie-break
//!
//! - New vs committed: the new article is discarded; the corpus is authoritative.
//! - New vs new: the later article in staging order is discarded.
//!
//! Each staged article is discarded at most once, so it yields at most one
//! blacklist entry.

use crate::config::DedupConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{BlacklistEntry, StagedArticle};
use crate::text::TextNormalizer;
use crate::tfidf::{PostingIndex, TfidfSpace};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::collections::BTreeSet;
use tracing::{debug, info, instrument};

/// What a discarded staged article matched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DuplicateOf {
    /// Row of the committed corpus (its dense index).
    Committed(usize),
    /// Earlier position in the staged batch.
    Staged(usize),
}

/// One confirmed duplicate.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateMatch {
    /// Position of the discarded article in the staged batch.
    pub staged: usize,
    pub duplicate_of: DuplicateOf,
    pub similarity: f32,
}

/// Result of a deduplication pass.
#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    /// Staged positions to remove, ascending.
    pub discarded: BTreeSet<usize>,
    /// One ledger entry per discarded article, in discard order.
    pub blacklist: Vec<BlacklistEntry>,
    /// The processed-title cache after this batch: old titles followed by the
    /// titles of surviving staged articles in staging order.
    pub titles: Vec<String>,
    pub matches: Vec<DuplicateMatch>,
}

impl DedupOutcome {
    /// Staged articles that survived, in staging order.
    pub fn survivors<'a>(&self, staged: &'a [StagedArticle]) -> Vec<&'a StagedArticle> {
        staged
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.discarded.contains(i))
            .map(|(_, a)| a)
            .collect()
    }
}

/// Title-based near-duplicate detector.
#[derive(Debug)]
pub struct Deduplicator<'a> {
    normalizer: &'a TextNormalizer,
    config: &'a DedupConfig,
    min_token_chars: usize,
}

impl<'a> Deduplicator<'a> {
    pub fn new(
        normalizer: &'a TextNormalizer,
        config: &'a DedupConfig,
        min_token_chars: usize,
    ) -> Self {
        Self {
            normalizer,
            config,
            min_token_chars,
        }
    }

    /// Detect duplicates in `staged` against the committed corpus.
    ///
    /// # Arguments
    ///
    /// * `old_titles` - The processed-title cache, aligned with dense indices
    /// * `old_published` - Publication time of each committed article, same alignment
    /// * `staged` - The staged batch in staging order
    ///
    /// # Errors
    ///
    /// [`PipelineError::ConsistencyViolation`] when the cache and the
    /// publication times are not aligned.
    #[instrument(level = "info", skip_all, fields(old = old_titles.len(), new = staged.len()))]
    pub fn detect(
        &self,
        old_titles: &[String],
        old_published: &[DateTime<Utc>],
        staged: &[StagedArticle],
    ) -> PipelineResult<DedupOutcome> {
        if old_titles.len() != old_published.len() {
            return Err(PipelineError::ConsistencyViolation(format!(
                "title cache has {} rows but the primary store has {} articles",
                old_titles.len(),
                old_published.len()
            )));
        }
        if staged.is_empty() {
            info!("No staged articles; nothing to deduplicate");
            return Ok(DedupOutcome {
                titles: old_titles.to_vec(),
                ..DedupOutcome::default()
            });
        }

        let new_titles: Vec<String> = staged
            .iter()
            .map(|a| self.normalizer.process_title(&a.title))
            .collect();

        let corpus: Vec<&str> = old_titles
            .iter()
            .chain(new_titles.iter())
            .map(String::as_str)
            .collect();
        let (space, rows) = TfidfSpace::fit_transform(&corpus, self.min_token_chars);
        let (old_rows, new_rows) = rows.split_at(old_titles.len());
        debug!(vocabulary = space.vocabulary_len(), "Fitted TF-IDF space");

        let threshold = self.config.similarity_threshold;
        let window_secs = self.config.time_window_hours * 3600.0;
        let within_window = |a: DateTime<Utc>, b: DateTime<Utc>| {
            ((a - b).num_milliseconds().abs() as f64 / 1000.0) < window_secs
        };

        let mut outcome = DedupOutcome::default();

        // new vs committed
        if !old_rows.is_empty() {
            let old_index = PostingIndex::build(old_rows);
            let candidates: Vec<Vec<(usize, f32)>> = new_rows
                .par_iter()
                .map(|row| old_index.matches(row, threshold))
                .collect();

            for (i, hits) in candidates.into_iter().enumerate() {
                for (j, similarity) in hits {
                    if !within_window(staged[i].published_at, old_published[j]) {
                        continue;
                    }
                    if outcome.discarded.insert(i) {
                        outcome
                            .blacklist
                            .push(BlacklistEntry::duplicate(&staged[i].source, &staged[i].uri));
                        outcome.matches.push(DuplicateMatch {
                            staged: i,
                            duplicate_of: DuplicateOf::Committed(j),
                            similarity,
                        });
                    }
                }
            }
        }

        // new vs new, upper triangle only
        let new_index = PostingIndex::build(new_rows);
        let candidates: Vec<Vec<(usize, f32)>> = new_rows
            .par_iter()
            .enumerate()
            .map(|(i, row)| {
                new_index
                    .matches(row, threshold)
                    .into_iter()
                    .filter(|&(j, _)| j > i)
                    .collect()
            })
            .collect();

        for (i, hits) in candidates.into_iter().enumerate() {
            for (j, similarity) in hits {
                if !within_window(staged[i].published_at, staged[j].published_at) {
                    continue;
                }
                if outcome.discarded.insert(j) {
                    outcome
                        .blacklist
                        .push(BlacklistEntry::duplicate(&staged[j].source, &staged[j].uri));
                    outcome.matches.push(DuplicateMatch {
                        staged: j,
                        duplicate_of: DuplicateOf::Staged(i),
                        similarity,
                    });
                }
            }
        }

        outcome.titles = old_titles.to_vec();
        outcome.titles.extend(
            new_titles
                .into_iter()
                .enumerate()
                .filter(|(i, _)| !outcome.discarded.contains(i))
                .map(|(_, t)| t),
        );

        info!(
            discarded = outcome.discarded.len(),
            surviving = staged.len() - outcome.discarded.len(),
            "Duplicate detection complete"
        );
        for m in &outcome.matches {
            debug!(
                staged = m.staged,
                duplicate_of = ?m.duplicate_of,
                similarity = m.similarity,
                uri = %staged[m.staged].uri,
                "Duplicate"
            );
        }
        Ok(outcome)
    }
}
