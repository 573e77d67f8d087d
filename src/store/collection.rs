//! JSON-lines document collections with whole-file atomic replacement.
//!
//! Every mutation rewrites the collection into a temporary sibling file and
//! renames it over the original, so a reader (or a crashed writer) only ever
//! sees the previous or the next complete state, never a half-written one.

use crate::error::{PipelineError, PipelineResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

/// Write `bytes` to `path` via a temporary file and a rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> PipelineResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| PipelineError::io(parent, e))?;
    }
    let tmp = tmp_path(path);
    let mut file = fs::File::create(&tmp)
        .await
        .map_err(|e| PipelineError::io(&tmp, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| PipelineError::io(&tmp, e))?;
    file.sync_all().await.map_err(|e| PipelineError::io(&tmp, e))?;
    drop(file);
    fs::rename(&tmp, path)
        .await
        .map_err(|e| PipelineError::io(path, e))?;
    Ok(())
}

/// Read `path`, treating a missing file as `None`.
pub async fn read_optional(path: &Path) -> PipelineResult<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PipelineError::io(path, e)),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// An ordered collection of `T`, one JSON document per line.
#[derive(Debug, Clone)]
pub struct JsonlCollection<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonlCollection<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    /// All documents in file order. A missing file is an empty collection.
    #[instrument(level = "debug", skip_all, fields(path = %self.path.display()))]
    pub async fn load(&self) -> PipelineResult<Vec<T>> {
        let Some(raw) = read_optional(&self.path).await? else {
            return Ok(Vec::new());
        };
        let mut docs = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let doc = serde_json::from_str(line).map_err(|e| PipelineError::decode(&self.path, e))?;
            docs.push(doc);
        }
        debug!(count = docs.len(), "Loaded collection");
        Ok(docs)
    }

    /// Number of documents, counted without decoding them.
    pub async fn count(&self) -> PipelineResult<usize> {
        Ok(read_optional(&self.path)
            .await?
            .map(|raw| raw.lines().filter(|l| !l.trim().is_empty()).count())
            .unwrap_or(0))
    }

    pub async fn is_empty(&self) -> PipelineResult<bool> {
        Ok(self.count().await? == 0)
    }

    /// Replace the whole collection with `docs`.
    pub async fn replace(&self, docs: &[T]) -> PipelineResult<()> {
        let mut out = String::new();
        for doc in docs {
            let line =
                serde_json::to_string(doc).map_err(|e| PipelineError::decode(&self.path, e))?;
            out.push_str(&line);
            out.push('\n');
        }
        write_atomic(&self.path, out.as_bytes()).await
    }

    pub async fn clear(&self) -> PipelineResult<()> {
        self.replace(&[]).await
    }
}
