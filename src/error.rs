//! Error taxonomy for the ingestion pipeline and the query layer.
//!
//! Per-article fetch outcomes are values, not errors: a fetch adapter returns
//! a [`FetchFailure`] carrying a [`FailureReason`], and the collector turns
//! structural failures into blacklist entries. Stage-level failures are
//! [`PipelineError`]s and abort the whole cycle, leaving persisted state in
//! its pre-stage shape.

use std::path::PathBuf;
use thiserror::Error;

/// Why a single article (or listing page) could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    /// Network error, timeout or server-side status. Retried next cycle.
    #[error("transient fetch failure: {0}")]
    Transient(String),
    /// The page was fetched but lacks the expected content. Blacklisted.
    #[error("structural fetch failure: {0}")]
    Structural(String),
}

impl FailureReason {
    pub fn is_structural(&self) -> bool {
        matches!(self, FailureReason::Structural(_))
    }
}

/// A failed article fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{uri}: {reason}")]
pub struct FetchFailure {
    pub uri: String,
    pub reason: FailureReason,
}

impl FetchFailure {
    pub fn transient(uri: &str, detail: impl Into<String>) -> Self {
        Self {
            uri: uri.to_string(),
            reason: FailureReason::Transient(detail.into()),
        }
    }

    pub fn structural(uri: &str, detail: impl Into<String>) -> Self {
        Self {
            uri: uri.to_string(),
            reason: FailureReason::Structural(detail.into()),
        }
    }
}

/// Fatal errors that abort an ingestion cycle.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("I/O failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to decode '{path}': {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// A persisted invariant is broken in a way the state machine cannot
    /// explain. Continuing would corrupt recommendations.
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("another ingestion cycle holds the lock at '{0}'")]
    LockHeld(PathBuf),

    #[error("topic vectorizer failed: {0}")]
    Vectorizer(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("duplicate article key ({publisher}, {uri})")]
    DuplicateKey { publisher: String, uri: String },

    #[error("HTTP client setup failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn decode(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        PipelineError::Decode {
            path: path.into(),
            source,
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors surfaced by the query layer.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("article with dense index {0} not found")]
    NotFound(u32),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_classification() {
        assert!(FailureReason::Structural("no title".into()).is_structural());
        assert!(!FailureReason::Transient("timeout".into()).is_structural());
    }

    #[test]
    fn test_fetch_failure_display() {
        let failure = FetchFailure::structural("https://x.example/a", "NO CONTENT");
        assert_eq!(
            failure.to_string(),
            "https://x.example/a: structural fetch failure: NO CONTENT"
        );
    }

    #[test]
    fn test_query_error_wraps_pipeline_error() {
        let err: QueryError = PipelineError::ConsistencyViolation("rows".into()).into();
        assert_eq!(err.to_string(), "consistency violation: rows");
    }
}
