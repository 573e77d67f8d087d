//! Sparse TF-IDF vector space over normalized titles.
//!
//! The space is fit once over `old ++ new` titles so that every vector shares
//! one vocabulary and one set of IDF weights. Weights use smoothed IDF,
//! `ln((1 + n) / (1 + df)) + 1`, raw term counts and L2 row normalization, so
//! the cosine similarity of two rows is their dot product.
//!
//! Tokens are the whitespace-separated words of a normalized title; words
//! shorter than `min_token_chars` characters are ignored.

use std::collections::{BTreeMap, HashMap};

/// A sparse, L2-normalized row sorted by term id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseVector {
    entries: Vec<(u32, f32)>,
}

impl SparseVector {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(u32, f32)] {
        &self.entries
    }

    /// Dot product with another row, i.e. cosine similarity for normalized rows.
    pub fn dot(&self, other: &SparseVector) -> f32 {
        let (mut i, mut j, mut acc) = (0, 0, 0.0f32);
        while i < self.entries.len() && j < other.entries.len() {
            let (ta, wa) = self.entries[i];
            let (tb, wb) = other.entries[j];
            match ta.cmp(&tb) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    acc += wa * wb;
                    i += 1;
                    j += 1;
                }
            }
        }
        acc
    }
}

/// Fitted vocabulary and IDF weights.
#[derive(Debug, Clone)]
pub struct TfidfSpace {
    vocabulary: HashMap<String, u32>,
    idf: Vec<f32>,
}

impl TfidfSpace {
    /// Fit the space over `docs` and return it together with the row of
    /// every document, in input order.
    pub fn fit_transform<S: AsRef<str>>(
        docs: &[S],
        min_token_chars: usize,
    ) -> (Self, Vec<SparseVector>) {
        let tokenized: Vec<Vec<&str>> = docs
            .iter()
            .map(|d| tokens(d.as_ref(), min_token_chars).collect())
            .collect();

        // sorted vocabulary keeps term ids independent of document order
        let mut df: BTreeMap<&str, u32> = BTreeMap::new();
        for doc in &tokenized {
            let mut seen: Vec<&str> = doc.clone();
            seen.sort_unstable();
            seen.dedup();
            for term in seen {
                *df.entry(term).or_default() += 1;
            }
        }

        let n = docs.len() as f32;
        let mut vocabulary = HashMap::with_capacity(df.len());
        let mut idf = Vec::with_capacity(df.len());
        for (id, (term, count)) in df.into_iter().enumerate() {
            vocabulary.insert(term.to_string(), id as u32);
            idf.push(((1.0 + n) / (1.0 + count as f32)).ln() + 1.0);
        }

        let space = Self { vocabulary, idf };
        let rows = tokenized.iter().map(|doc| space.weigh(doc)).collect();
        (space, rows)
    }

    pub fn vocabulary_len(&self) -> usize {
        self.idf.len()
    }

    fn weigh(&self, doc: &[&str]) -> SparseVector {
        let mut counts: BTreeMap<u32, f32> = BTreeMap::new();
        for term in doc {
            if let Some(&id) = self.vocabulary.get(*term) {
                *counts.entry(id).or_default() += 1.0;
            }
        }
        let mut entries: Vec<(u32, f32)> = counts
            .into_iter()
            .map(|(id, tf)| (id, tf * self.idf[id as usize]))
            .collect();
        let norm = entries.iter().map(|(_, w)| w * w).sum::<f32>().sqrt();
        if norm > 0.0 {
            for (_, w) in &mut entries {
                *w /= norm;
            }
        }
        SparseVector { entries }
    }
}

fn tokens(doc: &str, min_chars: usize) -> impl Iterator<Item = &str> {
    doc.split_whitespace()
        .filter(move |t| t.chars().count() >= min_chars)
}

/// Inverted index over a set of rows for thresholded similarity lookups.
///
/// Only rows sharing at least one term with the query are scored, which keeps
/// a new-vs-corpus pass proportional to term overlap rather than corpus size.
#[derive(Debug, Default)]
pub struct PostingIndex {
    postings: HashMap<u32, Vec<(usize, f32)>>,
}

impl PostingIndex {
    pub fn build(rows: &[SparseVector]) -> Self {
        let mut postings: HashMap<u32, Vec<(usize, f32)>> = HashMap::new();
        for (doc, row) in rows.iter().enumerate() {
            for &(term, weight) in row.entries() {
                postings.entry(term).or_default().push((doc, weight));
            }
        }
        Self { postings }
    }

    /// Rows whose cosine similarity with `query` is at least `threshold`,
    /// sorted by row id.
    pub fn matches(&self, query: &SparseVector, threshold: f32) -> Vec<(usize, f32)> {
        let mut scores: HashMap<usize, f32> = HashMap::new();
        for &(term, qw) in query.entries() {
            if let Some(list) = self.postings.get(&term) {
                for &(doc, dw) in list {
                    *scores.entry(doc).or_default() += qw * dw;
                }
            }
        }
        let mut hits: Vec<(usize, f32)> = scores
            .into_iter()
            // nonzero mirrors a sparse similarity matrix: a zero threshold
            // still never pairs rows without shared terms
            .filter(|&(_, s)| s > 0.0 && s >= threshold)
            .collect();
        hits.sort_unstable_by_key(|&(doc, _)| doc);
        hits
    }
}
