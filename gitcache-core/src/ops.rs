//! File-level operations on cached repositories
//!
//! Every operation follows the same shape: take the URI's lock, make sure a
//! clone exists, put it on the requested branch with a pristine tree, then
//! act. Git and filesystem work runs on tokio's blocking pool and the lock
//! guards travel with it, so a caller that gives up on a slow operation
//! never lets another one into the clone while git is still working.

use std::fmt;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use git2::Oid;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::git::{normalize_path, redact, validate_branch_name, GitRepo, Push, RepositoryCache};
use crate::lock::{FileLock, RepoLocks};
use crate::{Config, Credentials, Error, Result};

/// Kind of a listed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// One immediate child of a listed directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub name: String,
    pub kind: EntryKind,
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EntryKind::File => write!(f, "{}", self.name),
            EntryKind::Directory => write!(f, "{}/", self.name),
        }
    }
}

/// Read, write and list files on any branch of any remote
#[derive(Debug, Clone)]
pub struct FileOperations {
    cache: RepositoryCache,
    locks: Arc<RepoLocks>,
    operation_timeout: Duration,
}

impl FileOperations {
    /// Build from configuration, creating the cache root if needed
    pub fn new(config: &Config) -> Result<Self> {
        let cache = RepositoryCache::new(
            config.cache_root()?,
            &config.git.remote,
            config.git.network_timeout,
        )?;
        Ok(Self::with_cache(cache, config.git.operation_timeout))
    }

    pub fn with_cache(cache: RepositoryCache, operation_timeout: Duration) -> Self {
        Self {
            cache,
            locks: Arc::new(RepoLocks::new()),
            operation_timeout,
        }
    }

    pub fn cache(&self) -> &RepositoryCache {
        &self.cache
    }

    /// Contents of `path` on the tip of `branch`
    ///
    /// The branch is fast-forwarded first. Directories and missing paths are
    /// [`Error::NotFound`].
    pub async fn read_file(
        &self,
        uri: &str,
        branch: &str,
        path: &str,
        credentials: &Credentials,
    ) -> Result<Vec<u8>> {
        normalize_path(path)?;
        let shown = path.to_string();

        self.run("read", uri, branch, credentials, move |repo, branch, credentials| {
            repo.pull_fast_forward(branch, credentials)?;

            let full = repo.resolve(&shown)?;
            if full == repo.root() || full.is_dir() {
                return Err(Error::NotFound(format!("{} is not a file", shown)));
            }

            match fs::read(&full) {
                Ok(bytes) => {
                    debug!(path = %shown, bytes = bytes.len(), "Read file");
                    Ok(bytes)
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(
                    format!("{} does not exist on branch {}", shown, branch),
                )),
                Err(e) => Err(Error::storage(format!("Cannot read {}", shown), e)),
            }
        })
        .await
    }

    /// Commit `content` at `path` on `branch` and push it
    ///
    /// The clone is not pulled first, so a stale clone gets a non-fast-forward
    /// rejection, reported as [`Error::RemoteAccess`]. The refused commit is
    /// kept under [`crate::git::UNPUBLISHED_REFS`].
    #[allow(clippy::too_many_arguments)]
    pub async fn write_file(
        &self,
        uri: &str,
        branch: &str,
        path: &str,
        content: &[u8],
        message: &str,
        committer: &str,
        credentials: &Credentials,
    ) -> Result<()> {
        normalize_path(path)?;
        let path = path.to_string();
        let content = content.to_vec();
        let message = message.to_string();
        let committer = committer.to_string();

        self.run("write", uri, branch, credentials, move |repo, branch, credentials| {
            let commit = repo.commit_path(&path, &content, &message, &committer)?;

            match repo.transfer(credentials).push_branch(repo.inner(), branch)? {
                Push::Published(_) => {
                    info!(uri = %redact(repo.uri()), branch, path = %path, %commit, "Committed and pushed");
                    Ok(())
                }
                Push::Rejected(reason) => {
                    warn!(branch, path = %path, %commit, %reason, "Push rejected");
                    repo.park_unpublished(branch)?;
                    Err(Error::RemoteAccess(format!(
                        "Push of {} to branch {} rejected: {}",
                        path, branch, reason
                    )))
                }
            }
        })
        .await
    }

    /// Immediate children of `path` on the tip of `branch`, sorted by name
    ///
    /// Anything that is not a directory, including a missing path, lists as
    /// empty.
    pub async fn list_files(
        &self,
        uri: &str,
        branch: &str,
        path: &str,
        credentials: &Credentials,
    ) -> Result<Vec<Entry>> {
        normalize_path(path)?;
        let path = path.to_string();

        self.run("list", uri, branch, credentials, move |repo, branch, credentials| {
            repo.pull_fast_forward(branch, credentials)?;
            list_dir(repo, &path)
        })
        .await
    }

    /// Commits on `branch` that the remote refused and that were kept aside
    pub async fn unpublished(
        &self,
        uri: &str,
        branch: &str,
        credentials: &Credentials,
    ) -> Result<Vec<Oid>> {
        validate_branch_name(branch)?;
        let cache = self.cache.clone();
        let uri = uri.to_string();
        let branch = branch.to_string();
        let credentials = credentials.clone();

        self.guarded("unpublished", uri.clone(), move || {
            let repo = cache.acquire(&uri, &credentials)?;
            repo.unpublished_commits(&branch)
        })
        .await
    }

    /// Lock, acquire, prepare, then hand the clone to `action`
    async fn run<T, F>(
        &self,
        operation: &'static str,
        uri: &str,
        branch: &str,
        credentials: &Credentials,
        action: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&GitRepo, &str, &Credentials) -> Result<T> + Send + 'static,
    {
        validate_branch_name(branch)?;
        let cache = self.cache.clone();
        let uri = uri.to_string();
        let branch = branch.to_string();
        let credentials = credentials.clone();

        debug!(operation, uri = %redact(&uri), branch = %branch, "Starting operation");
        self.guarded(operation, uri.clone(), move || {
            let repo = cache.acquire(&uri, &credentials)?;
            repo.prepare(&branch, &credentials)?;
            action(&repo, branch.as_str(), &credentials)
        })
        .await
    }

    /// Run `work` on the blocking pool holding both locks for `uri`
    async fn guarded<T, F>(&self, operation: &'static str, uri: String, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let locks = Arc::clone(&self.locks);
        let lock_path = self.cache.lock_path(&uri);

        let task = async move {
            let guard = locks.lock(&uri).await;
            tokio::task::spawn_blocking(move || {
                let _guard = guard;
                let _file_lock = FileLock::acquire(&lock_path)?;
                work()
            })
            .await
        };

        match tokio::time::timeout(self.operation_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(Error::LocalStorage(format!(
                "{} worker failed: {}",
                operation, join
            ))),
            Err(_) => {
                warn!(operation, timeout = ?self.operation_timeout, "Operation timed out");
                Err(Error::RemoteAccess(format!(
                    "{} timed out after {:?}",
                    operation, self.operation_timeout
                )))
            }
        }
    }
}

fn list_dir(repo: &GitRepo, relative: &str) -> Result<Vec<Entry>> {
    let dir = repo.resolve(relative)?;
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let at_root = dir == repo.root();
    let read = fs::read_dir(&dir)
        .map_err(|e| Error::storage(format!("Cannot list {}", dir.display()), e))?;

    let mut entries = Vec::new();
    for entry in read {
        let entry = entry.map_err(|e| Error::storage(format!("Cannot list {}", dir.display()), e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if at_root && name == ".git" {
            continue;
        }

        let file_type = entry
            .file_type()
            .map_err(|e| Error::storage(format!("Cannot stat {}", entry.path().display()), e))?;
        let kind = if file_type.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        entries.push(Entry { name, kind });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}
