//! Data models for the article corpus and its query projections.
//!
//! This module defines the core data structures shared by every stage of the
//! ingestion pipeline and by the query layer:
//! - [`Article`]: A committed article addressed by its dense index
//! - [`StagedArticle`]: A freshly fetched article waiting in the staging store
//! - [`ContentBlock`]: One block of article body (text, image, or image group)
//! - [`BlacklistEntry`]: A URI that must never be fetched or inserted again
//! - [`ShortArticle`] / [`ArticleRecommendation`]: Query layer projections
//!
//! Timestamps are stored in UTC; sources publishing in a local time zone are
//! converted by the fetch adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pseudo-category used by listing requests to mean "every category".
pub const LATEST_CATEGORY: &str = "latest";

/// One block of an article body, kept in document order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentBlock {
    /// A paragraph or heading.
    Text { text: String },
    /// A single figure with its caption (empty when the page had none).
    Image { uri: String, caption: String },
    /// A photo grid, each cell being an image.
    ImageGroup { images: Vec<ImageRef> },
}

/// Image reference inside an [`ContentBlock::ImageGroup`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub uri: String,
    pub caption: String,
}

/// A freshly fetched article that has not been merged into the corpus yet.
///
/// Staged articles have no dense index: one is assigned only when the
/// committer moves them into the primary store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedArticle {
    /// The source (publisher) name, used to route blacklist entries.
    pub source: String,
    /// Article URI, unique within its source.
    pub uri: String,
    pub title: String,
    pub description: String,
    pub published_at: DateTime<Utc>,
    pub content: Vec<ContentBlock>,
    pub thumbnail_uri: Option<String>,
    /// Corpus category after the source's category mapping.
    pub category: String,
}

impl StagedArticle {
    /// Text blocks and image captions, in document order.
    ///
    /// This is the body text fed to the topic vectorizer.
    pub fn body_text(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for block in &self.content {
            match block {
                ContentBlock::Text { text } => out.push(text.as_str()),
                ContentBlock::Image { caption, .. } if !caption.is_empty() => {
                    out.push(caption.as_str())
                }
                ContentBlock::Image { .. } | ContentBlock::ImageGroup { .. } => {}
            }
        }
        out
    }

    /// Promote this staged article into a committed [`Article`].
    pub fn into_article(self, dense_index: u32) -> Article {
        Article {
            source: self.source,
            uri: self.uri,
            title: self.title,
            description: self.description,
            published_at: self.published_at,
            content: self.content,
            thumbnail_uri: self.thumbnail_uri,
            category: self.category,
            dense_index: Some(dense_index),
        }
    }
}

/// A committed article in the primary store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub source: String,
    pub uri: String,
    pub title: String,
    pub description: String,
    pub published_at: DateTime<Utc>,
    pub content: Vec<ContentBlock>,
    pub thumbnail_uri: Option<String>,
    pub category: String,
    /// Contiguous integer key shared with the neighbor graph. Assigned once,
    /// at commit time, and never changed afterwards.
    pub dense_index: Option<u32>,
}

impl From<Article> for StagedArticle {
    /// Drop the dense index, e.g. to re-vectorize committed articles.
    fn from(article: Article) -> Self {
        Self {
            source: article.source,
            uri: article.uri,
            title: article.title,
            description: article.description,
            published_at: article.published_at,
            content: article.content,
            thumbnail_uri: article.thumbnail_uri,
            category: article.category,
        }
    }
}

/// Why a URI ended up on the blacklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlacklistReason {
    /// The page was fetched but did not have the expected shape.
    #[default]
    Structural,
    /// The deduplicator confirmed it as a near-duplicate of another article.
    Duplicate,
}

/// A permanently excluded URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub uri: String,
    pub source: String,
    #[serde(default)]
    pub reason: BlacklistReason,
}

impl BlacklistEntry {
    pub fn structural(source: &str, uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            source: source.to_string(),
            reason: BlacklistReason::Structural,
        }
    }

    pub fn duplicate(source: &str, uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            source: source.to_string(),
            reason: BlacklistReason::Duplicate,
        }
    }

    /// The `(source, uri)` key the ledger is unique on.
    pub fn key(&self) -> (String, String) {
        (self.source.clone(), self.uri.clone())
    }
}

/// Listing/search projection of an article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortArticle {
    pub dense_index: Option<u32>,
    pub title: String,
    pub description: String,
    pub thumbnail_uri: Option<String>,
    pub published_at: DateTime<Utc>,
}

impl From<&Article> for ShortArticle {
    fn from(article: &Article) -> Self {
        Self {
            dense_index: article.dense_index,
            title: article.title.clone(),
            description: article.description.clone(),
            thumbnail_uri: article.thumbnail_uri.clone(),
            published_at: article.published_at,
        }
    }
}

/// An article together with its nearest-neighbor recommendations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleRecommendation {
    pub article: Article,
    pub recommendations: Vec<ShortArticle>,
}


#[cfg(test)]
mod tests {
    use super::fixtures::staged;
    use super::*;

    #[test]
    fn test_content_block_serialization_is_tagged() {
        let block = ContentBlock::Image {
            uri: "https://img.example/1.jpg".to_string(),
            caption: "A caption".to_string(),
        };
        let json = serde_json::to_string(&block).unwrap();
        assert!(json.contains(r#""kind":"image""#));

        let back: ContentBlock = serde_json::from_str(&json).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn test_body_text_skips_images_without_caption() {
        let mut article = staged("dantri", "https://dantri.example/a", "Flood", 8);
        article.content.push(ContentBlock::Image {
            uri: "https://img.example/1.jpg".to_string(),
            caption: String::new(),
        });
        article.content.push(ContentBlock::Image {
            uri: "https://img.example/2.jpg".to_string(),
            caption: "Rescue boats".to_string(),
        });
        article.content.push(ContentBlock::ImageGroup { images: vec![] });

        assert_eq!(article.body_text(), vec!["Flood body", "Rescue boats"]);
    }

    #[test]
    fn test_into_article_assigns_dense_index() {
        let article =
            staged("vnexpress", "https://vnexpress.example/b", "Storm", 9).into_article(41);
        assert_eq!(article.dense_index, Some(41));
        assert_eq!(article.source, "vnexpress");
    }

    #[test]
    fn test_blacklist_reason_defaults_to_structural() {
        let json = r#"{"uri": "https://x.example/1", "source": "x"}"#;
        let entry: BlacklistEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.reason, BlacklistReason::Structural);
        assert_eq!(entry.key(), ("x".to_string(), "https://x.example/1".to_string()));
    }

    #[test]
    fn test_short_article_projection() {
        let article = staged("dantri", "https://dantri.example/c", "Market", 10).into_article(3);
        let short = ShortArticle::from(&article);
        assert_eq!(short.dense_index, Some(3));
        assert_eq!(short.title, "Market");
        assert_eq!(short.thumbnail_uri.as_deref(), Some("https://dantri.example/c.jpg"));
    }
}
