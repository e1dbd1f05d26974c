//! Per-repository locking
//!
//! Two levels guard each clone. [`RepoLocks`] serialises tasks in this
//! process with one async mutex per URI. [`FileLock`] is an OS advisory lock
//! on a file next to the clone, so separate processes sharing a cache root
//! also take turns. Both are released on drop.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::{Error, Result};

/// In-process lock registry keyed by repository URI
#[derive(Debug, Default)]
pub struct RepoLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `uri`
    ///
    /// The guard is owned so it can be moved into a blocking task and outlive
    /// the caller's future.
    pub async fn lock(&self, uri: &str) -> OwnedMutexGuard<()> {
        let mutex = self.entry(uri);
        mutex.lock_owned().await
    }

    /// Number of URIs with a live lock entry
    pub fn len(&self) -> usize {
        self.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, uri: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.registry();

        // Entries nobody holds or waits on are only referenced by the map
        locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);

        Arc::clone(locks.entry(uri.to_string()).or_default())
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        // The map holds no invariants a panicking holder could break
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Exclusive advisory lock on a file, held until dropped
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: File,
}

impl FileLock {
    /// Block until the lock at `path` is held, creating the file if needed
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::storage(format!("Cannot open lock file {}", path.display()), e))?;

        file.lock_exclusive()
            .map_err(|e| Error::storage(format!("Cannot lock {}", path.display()), e))?;

        debug!(path = %path.display(), "Acquired file lock");
        Ok(Self { path, file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release file lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_same_uri_is_exclusive() {
        let locks = RepoLocks::new();
        let guard = locks.lock("https://example.com/a.git").await;

        let waiting = tokio::time::timeout(
            Duration::from_millis(50),
            locks.lock("https://example.com/a.git"),
        )
        .await;
        assert!(waiting.is_err());

        drop(guard);
        let _again = locks.lock("https://example.com/a.git").await;
    }

    #[tokio::test]
    async fn test_distinct_uris_do_not_contend() {
        let locks = RepoLocks::new();
        let _a = locks.lock("https://example.com/a.git").await;

        let b = tokio::time::timeout(
            Duration::from_millis(50),
            locks.lock("https://example.com/b.git"),
        )
        .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_idle_entries_are_pruned() {
        let locks = RepoLocks::new();
        drop(locks.lock("one").await);
        drop(locks.lock("two").await);

        let _three = locks.lock("three").await;
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn test_file_lock_excludes_second_holder() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("repo.lock");

        let held = FileLock::acquire(&path).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let contender = path.clone();
        let waiter = std::thread::spawn(move || {
            let lock = FileLock::acquire(&contender).unwrap();
            tx.send(()).unwrap();
            drop(lock);
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(held);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }
}
