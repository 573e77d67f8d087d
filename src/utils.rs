//! Logging and file system helpers.

use crate::error::{PipelineError, PipelineResult};
use std::path::Path;
use tokio::fs;
use tracing::{info, instrument};

/// Truncate a string for logging purposes.
///
/// Long strings are cut after `max` bytes (backing off to a character
/// boundary) with an ellipsis and byte count indicator appended.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(truncate_for_log("short", 100), "short");
/// assert_eq!(truncate_for_log(&"a".repeat(500), 10), "aaaaaaaaaa…(+490 bytes)");
/// ```
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…(+{} bytes)", &s[..end], s.len() - end)
}

/// Ensure a directory exists and is writable.
///
/// Creates the directory if needed, then creates and removes a probe file.
///
/// # Errors
///
/// [`PipelineError::Io`] if the directory cannot be created or written to.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn ensure_writable_dir(path: &Path) -> PipelineResult<()> {
    fs::create_dir_all(path)
        .await
        .map_err(|e| PipelineError::io(path, e))?;
    let probe = path.join(".__probe_write__");
    fs::write(&probe, b"")
        .await
        .map_err(|e| PipelineError::io(&probe, e))?;
    let _ = fs::remove_file(&probe).await;
    info!("Data directory is writable");
    Ok(())
}
