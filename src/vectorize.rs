//! Topic vectorization of articles.
//!
//! The pipeline depends only on the [`TopicVectorizer`] contract: map an
//! article's normalized title, description and body to a fixed-length topic
//! distribution. [`LexiconTopicModel`] is the adapter for a topic model
//! exported as per-word topic weights, e.g. the `topic-word` matrix of a
//! trained LDA model.
//!
//! # Model file
//!
//! ```json
//! {
//!   "num_topics": 3,
//!   "alpha": 0.01,
//!   "words": { "bão": [0.9, 0.05, 0.05], "vàng": [0.0, 0.1, 0.9] }
//! }
//! ```

use crate::error::{PipelineError, PipelineResult};
use crate::models::StagedArticle;
use crate::text::TextNormalizer;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, instrument};

/// Maps article text to a topic distribution of fixed length.
pub trait TopicVectorizer: Send + Sync {
    /// Length of every vector this vectorizer returns.
    fn num_topics(&self) -> usize;

    /// Topic vector for the given normalized tokens.
    fn vectorize(&self, tokens: &[String]) -> PipelineResult<Vec<f32>>;
}

/// Normalized tokens of an article's title, description and body text.
pub fn article_tokens(normalizer: &TextNormalizer, article: &StagedArticle) -> Vec<String> {
    let mut tokens = normalizer.tokens(&article.title);
    tokens.extend(normalizer.tokens(&article.description));
    for text in article.body_text() {
        tokens.extend(normalizer.tokens(text));
    }
    tokens
}

/// Vectorize a batch, checking every vector has the advertised length.
///
/// # Errors
///
/// Any vectorizer failure aborts the batch with [`PipelineError::Vectorizer`].
#[instrument(level = "info", skip_all, fields(count = articles.len()))]
pub fn vectorize_batch(
    vectorizer: &dyn TopicVectorizer,
    normalizer: &TextNormalizer,
    articles: &[&StagedArticle],
) -> PipelineResult<Vec<Vec<f32>>> {
    let expected = vectorizer.num_topics();
    articles
        .iter()
        .map(|article| {
            let v = vectorizer.vectorize(&article_tokens(normalizer, article))?;
            if v.len() != expected {
                return Err(PipelineError::Vectorizer(format!(
                    "vector for '{}' has {} components, expected {expected}",
                    article.uri,
                    v.len()
                )));
            }
            Ok(v)
        })
        .collect()
}

/// Topic model given as per-word topic weights.
///
/// A document's vector is `alpha` plus the sum of its known words' weight
/// rows, normalized to sum to one. Documents without known words get the
/// uniform distribution.
#[derive(Debug, Clone, Deserialize)]
pub struct LexiconTopicModel {
    num_topics: usize,
    #[serde(default = "default_alpha")]
    alpha: f32,
    words: HashMap<String, Vec<f32>>,
}

fn default_alpha() -> f32 {
    0.01
}

impl LexiconTopicModel {
    /// Load and validate a model file.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Vectorizer`] when the file is missing, malformed, or
    /// has a weight row of the wrong length. A missing model makes the
    /// vectorizer unavailable, which aborts the indexing stage.
    #[instrument(level = "info", fields(path = %path.display()))]
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Vectorizer(format!("cannot read {}: {e}", path.display()))
        })?;
        let model: LexiconTopicModel = serde_json::from_str(&raw).map_err(|e| {
            PipelineError::Vectorizer(format!("cannot parse {}: {e}", path.display()))
        })?;
        model.validate()?;
        info!(topics = model.num_topics, words = model.words.len(), "Loaded topic model");
        Ok(model)
    }

    pub fn new(
        num_topics: usize,
        alpha: f32,
        words: HashMap<String, Vec<f32>>,
    ) -> PipelineResult<Self> {
        let model = Self {
            num_topics,
            alpha,
            words,
        };
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> PipelineResult<()> {
        if self.num_topics == 0 {
            return Err(PipelineError::Vectorizer("num_topics must be positive".to_string()));
        }
        if let Some((word, row)) = self.words.iter().find(|(_, row)| row.len() != self.num_topics) {
            return Err(PipelineError::Vectorizer(format!(
                "word '{word}' has {} weights, expected {}",
                row.len(),
                self.num_topics
            )));
        }
        Ok(())
    }
}

impl TopicVectorizer for LexiconTopicModel {
    fn num_topics(&self) -> usize {
        self.num_topics
    }

    fn vectorize(&self, tokens: &[String]) -> PipelineResult<Vec<f32>> {
        let mut v = vec![self.alpha.max(0.0); self.num_topics];
        for token in tokens {
            if let Some(row) = self.words.get(token) {
                for (acc, w) in v.iter_mut().zip(row) {
                    *acc += w.max(0.0);
                }
            }
        }
        let total: f32 = v.iter().sum();
        if total > 0.0 {
            v.iter_mut().for_each(|x| *x /= total);
        } else {
            v.fill(1.0 / self.num_topics as f32);
        }
        Ok(v)
    }
}
