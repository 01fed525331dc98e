//! Per-collection write locks.
//!
//! A lock is a marker file created next to the collection file with
//! `create_new`, so only one writer can hold it. The marker is removed when
//! the write completes (or when the guard drops on an error path). A crash
//! between creation and removal leaves the marker behind; [`clear_locks`]
//! removes those at start-up, which is only sound while no writer is live.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};

pub(crate) const LOCK_SUFFIX: &str = ".lock";

/// Retry policy for contended locks.
#[derive(Debug, Clone)]
pub struct LockPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for LockPolicy {
    /// About five seconds of waiting in total before giving up.
    fn default() -> Self {
        Self {
            attempts: 30,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(250),
        }
    }
}

pub(crate) fn marker_path(target: &Path) -> PathBuf {
    let mut s: OsString = target.as_os_str().to_owned();
    s.push(LOCK_SUFFIX);
    PathBuf::from(s)
}

/// Exclusive hold on one collection file. Released on drop.
#[derive(Debug)]
pub(crate) struct TableLock {
    path: PathBuf,
    released: bool,
}

impl TableLock {
    pub(crate) async fn acquire(target: &Path, policy: &LockPolicy) -> Result<Self> {
        let path = marker_path(target);
        let mut backoff = policy.initial_backoff;

        for attempt in 0..policy.attempts.max(1) {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    let lock = Self { path, released: false };
                    let stamp = format!("{} {}\n", std::process::id(), chrono::Utc::now().to_rfc3339());
                    file.write_all(stamp.as_bytes()).await?;
                    if attempt > 0 {
                        debug!("Acquired {} after {} retries", lock.path.display(), attempt);
                    }
                    return Ok(lock);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(policy.max_backoff);
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!("Gave up waiting for lock {}", path.display());
        Err(StoreError::LockTimeout(path))
    }

    pub(crate) async fn release(mut self) -> Result<()> {
        self.released = true;
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Lock {} vanished before release", self.path.display());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for TableLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Remove lock markers under `root`.
///
/// With `older_than = None` every marker goes; this must only run when no
/// writer is active (process start). With a threshold, only markers older
/// than it are removed, which is what the periodic sweep uses.
pub async fn clear_locks(root: &Path, older_than: Option<Duration>) -> Result<usize> {
    let mut removed = 0;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            let is_marker = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(LOCK_SUFFIX));
            if !is_marker {
                continue;
            }

            if let Some(threshold) = older_than {
                let modified = entry.metadata().await?.modified()?;
                let age = SystemTime::now().duration_since(modified).unwrap_or_default();
                if age < threshold {
                    continue;
                }
            }

            match fs::remove_file(&path).await {
                Ok(()) => {
                    warn!("Removed orphaned lock {}", path.display());
                    removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(removed)
}
