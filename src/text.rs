//! Title and paragraph normalization.
//!
//! Normalization lowercases the text, deletes punctuation, symbols and digits,
//! tokenizes, and drops stop words. Multi-syllable tokens produced by a
//! word-segmenting tokenizer are joined with `_` so they survive whitespace
//! splitting downstream (TF-IDF, topic model lookup).
//!
//! The normalizer is built once from configuration and shared immutably.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// Word segmentation seam.
///
/// The default [`WhitespaceTokenizer`] splits on whitespace; a language-aware
/// segmenter can return multi-word tokens such as `"hà nội"`.
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        text.split_whitespace().map(str::to_string).collect()
    }
}

/// Immutable text normalizer shared by the deduplicator and the vectorizer.
pub struct TextNormalizer {
    stop_words: HashSet<String>,
    tokenizer: Box<dyn Tokenizer>,
}

impl std::fmt::Debug for TextNormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextNormalizer")
            .field("stop_words", &self.stop_words.len())
            .finish()
    }
}

impl TextNormalizer {
    pub fn new<I, S>(stop_words: I, tokenizer: Box<dyn Tokenizer>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            stop_words: stop_words
                .into_iter()
                .map(|w| w.as_ref().to_lowercase())
                .collect(),
            tokenizer,
        }
    }

    /// Normalizer with the given stop words and whitespace tokenization.
    pub fn with_stop_words<I, S>(stop_words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(stop_words, Box::new(WhitespaceTokenizer))
    }

    /// Normalized tokens of `text`.
    pub fn tokens(&self, text: &str) -> Vec<String> {
        let stripped = strip_non_letters(&text.to_lowercase());
        let collapsed = WHITESPACE.replace_all(stripped.trim(), " ");
        self.tokenizer
            .tokenize(&collapsed)
            .into_iter()
            .filter(|t| !self.stop_words.contains(t))
            .map(|t| t.split_whitespace().collect::<Vec<_>>().join("_"))
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Normalized title as a single space-joined string, the unit stored in
    /// the processed-title cache.
    pub fn process_title(&self, title: &str) -> String {
        self.tokens(title).join(" ")
    }
}

/// Delete every character that is neither a letter, a combining mark nor
/// whitespace. Deletion (not replacement) matches how punctuation inside
/// words like `covid-19` or `u.s.` is collapsed.
fn strip_non_letters(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphabetic() || c.is_whitespace() || is_combining_mark(*c))
        .collect()
}

fn is_combining_mark(c: char) -> bool {
    matches!(c as u32, 0x0300..=0x036F | 0x1AB0..=0x1AFF | 0x1DC0..=0x1DFF | 0x20D0..=0x20FF)
}
