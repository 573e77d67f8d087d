//! Ingestion mutual exclusion.
//!
//! The guard holds an exclusive advisory lock on an open handle to the lock
//! file: only one ingestion cycle may hold it. The operating system releases
//! the lock when the handle closes, including when the holder is killed, so a
//! file left behind by a crashed process never blocks the next cycle. The
//! file itself records the current holder's pid and start time for operators.

use crate::error::{PipelineError, PipelineResult};
use chrono::Utc;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Held ingestion lock; released when dropped or when the process exits.
#[derive(Debug)]
pub struct IngestLock {
    path: PathBuf,
    file: File,
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl IngestLock {
    /// Acquire the lock at `path`, creating the file if needed.
    ///
    /// # Errors
    ///
    /// [`PipelineError::LockHeld`] if another cycle holds it.
    pub fn acquire(path: &Path) -> PipelineResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| PipelineError::io(path, e))?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => return Err(PipelineError::LockHeld(path.to_path_buf())),
            Err(e) => return Err(PipelineError::io(path, e)),
        }

        // holder line is diagnostics only
        let stamp = format!("pid={} started={}\n", std::process::id(), Utc::now().to_rfc3339());
        if let Err(e) = file.set_len(0).and_then(|()| file.write_all(stamp.as_bytes())) {
            warn!(path = %path.display(), error = %e, "Failed to record lock holder");
        }
        info!(path = %path.display(), "Acquired ingestion lock");
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }
}

impl Drop for IngestLock {
    fn drop(&mut self) {
        // the file stays; removing it would race a waiter that already opened it
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release ingestion lock");
        } else {
            debug!(path = %self.path.display(), "Released ingestion lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingest.lock");

        let lock = IngestLock::acquire(&path).unwrap();
        assert!(matches!(IngestLock::acquire(&path), Err(PipelineError::LockHeld(_))));
        drop(lock);

        let _again = IngestLock::acquire(&path).unwrap();
    }

    #[test]
    fn test_leftover_file_without_holder_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingest.lock");
        std::fs::write(&path, "pid=4194303 started=2024-07-23T08:00:00+00:00\n").unwrap();

        let _lock = IngestLock::acquire(&path).unwrap();
        let holder = std::fs::read_to_string(&path).unwrap();
        assert_eq!(holder.lines().count(), 1);
        assert!(holder.starts_with(&format!("pid={} ", std::process::id())));
    }
}
