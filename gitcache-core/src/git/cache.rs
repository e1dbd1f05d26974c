//! On-disk clone cache keyed by repository URI
//!
//! Each URI owns exactly one directory under the cache root, named by the
//! SHA-256 of the URI. The directory is the only record of the clone: there
//! is no in-memory index to rebuild after a restart.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::remote::{redact, Transfer};
use super::repo::GitRepo;
use crate::{Credentials, Error, Result};

/// Cache of local clones
#[derive(Debug, Clone)]
pub struct RepositoryCache {
    /// Directory holding one clone per URI
    root: PathBuf,
    /// Remote name used for every clone
    remote: String,
    /// Deadline for each clone/fetch/push
    network_timeout: Duration,
}

impl RepositoryCache {
    /// Create a cache rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>, remote: &str, network_timeout: Duration) -> Result<Self> {
        let root = root.into();

        if root.exists() && !root.is_dir() {
            return Err(Error::Config(format!(
                "Clone location {} is not a directory",
                root.display()
            )));
        }

        fs::create_dir_all(&root).map_err(|e| {
            Error::storage(format!("Failed to create cache root {}", root.display()), e)
        })?;

        Ok(Self {
            root,
            remote: remote.to_string(),
            network_timeout,
        })
    }

    /// Get the cache root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Name of the tracked remote
    pub fn remote_name(&self) -> &str {
        &self.remote
    }

    /// Deadline for each clone/fetch/push
    pub fn network_timeout(&self) -> Duration {
        self.network_timeout
    }

    /// Directory a URI is cloned into
    pub fn repo_dir(&self, uri: &str) -> PathBuf {
        self.root.join(dir_name(uri))
    }

    /// Advisory lock file guarding a URI's clone
    ///
    /// Lives next to the clone so that wiping a corrupt clone keeps it.
    pub fn lock_path(&self, uri: &str) -> PathBuf {
        self.root.join(format!("{}.lock", dir_name(uri)))
    }

    /// Whether a clone directory exists for the URI
    pub fn is_cached(&self, uri: &str) -> bool {
        self.repo_dir(uri).exists()
    }

    /// Return an opened clone of `uri`, cloning or recovering as needed
    ///
    /// A directory that exists but does not open as a repository is left over
    /// from an interrupted clone: its contents are wiped and it is cloned
    /// again, once. A second failure is returned to the caller.
    pub fn acquire(&self, uri: &str, credentials: &Credentials) -> Result<GitRepo> {
        let dir = self.repo_dir(uri);

        if !dir.exists() {
            info!(uri = %redact(uri), dir = %dir.display(), "Cloning repository into cache");
            self.clone_repo(uri, &dir, credentials)?;
            return self.open(uri, &dir);
        }

        match self.open(uri, &dir) {
            Ok(repo) => {
                debug!(uri = %redact(uri), dir = %dir.display(), "Reusing cached clone");
                Ok(repo)
            }
            Err(e) => {
                warn!(
                    uri = %redact(uri),
                    dir = %dir.display(),
                    error = %e,
                    "Cached clone is corrupted, re-cloning"
                );
                clean_directory(&dir)?;
                self.clone_repo(uri, &dir, credentials)?;
                self.open(uri, &dir).map_err(|e| {
                    Error::LocalStorage(format!(
                        "Clone of {} in {} is unusable after recloning: {}",
                        redact(uri),
                        dir.display(),
                        e
                    ))
                })
            }
        }
    }

    fn open(&self, uri: &str, dir: &Path) -> Result<GitRepo> {
        Ok(GitRepo::open(dir, uri, &self.remote)?.with_network_timeout(self.network_timeout))
    }

    fn clone_repo(&self, uri: &str, dir: &Path, credentials: &Credentials) -> Result<()> {
        Transfer::new(credentials, &self.remote, self.network_timeout).clone_into(uri, dir)?;
        info!(uri = %redact(uri), "Clone complete");
        Ok(())
    }
}

/// Directory name for a URI: `r` followed by the hex SHA-256 of the URI
pub fn dir_name(uri: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(uri.as_bytes());
    format!("r{}", hex::encode(hasher.finalize()))
}

/// Remove everything inside `dir`, keeping the directory itself
fn clean_directory(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        // A stray file where the clone should be
        return fs::remove_file(dir)
            .map_err(|e| Error::storage(format!("Failed to remove {}", dir.display()), e));
    }

    let entries = fs::read_dir(dir)
        .map_err(|e| Error::storage(format!("Failed to read {}", dir.display()), e))?;

    for entry in entries {
        let path = entry
            .map_err(|e| Error::storage(format!("Failed to read {}", dir.display()), e))?
            .path();
        let removed = if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.map_err(|e| Error::storage(format!("Failed to remove {}", path.display()), e))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RemoteFixture;
    use tempfile::TempDir;

    fn cache(temp: &TempDir) -> RepositoryCache {
        RepositoryCache::new(temp.path().join("repos"), "origin", Duration::from_secs(30)).unwrap()
    }

    #[test]
    fn test_dir_name_is_deterministic() {
        let a = dir_name("https://github.com/o/r.git");
        assert_eq!(a, dir_name("https://github.com/o/r.git"));
        assert_ne!(a, dir_name("https://github.com/o/r2.git"));
        assert_eq!(a.len(), 65);
        assert!(a.starts_with('r'));
    }

    #[test]
    fn test_root_must_be_directory() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("file");
        fs::write(&file, "x").unwrap();
        let result = RepositoryCache::new(&file, "origin", Duration::from_secs(1));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_acquire_clones_then_reuses() {
        let remote = RemoteFixture::new();
        remote.commit("master", &[("a.txt", "one")]);
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp);

        assert!(!cache.is_cached(&remote.uri()));
        let first = cache.acquire(&remote.uri(), &Credentials::Anonymous).unwrap();
        assert!(cache.is_cached(&remote.uri()));
        let second = cache.acquire(&remote.uri(), &Credentials::Anonymous).unwrap();

        assert_eq!(first.root(), second.root());
        assert_eq!(
            first.root().canonicalize().unwrap(),
            cache.repo_dir(&remote.uri()).canonicalize().unwrap()
        );
        assert_eq!(fs::read_to_string(first.root().join("a.txt")).unwrap(), "one");
    }

    #[test]
    fn test_acquire_clones_all_branches() {
        let remote = RemoteFixture::new();
        remote.commit("master", &[("a.txt", "one")]);
        remote.commit("secora", &[("b.txt", "two")]);
        let temp = TempDir::new().unwrap();

        let repo = cache(&temp).acquire(&remote.uri(), &Credentials::Anonymous).unwrap();
        assert_eq!(repo.remote_branch_tip("secora"), remote.tip("secora"));
        assert_eq!(repo.remote_branch_tip("master"), remote.tip("master"));
    }

    #[test]
    fn test_acquire_recovers_corrupt_clone() {
        let remote = RemoteFixture::new();
        remote.commit("master", &[("a.txt", "one")]);
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp);

        let dir = cache.acquire(&remote.uri(), &Credentials::Anonymous).unwrap().root().to_path_buf();
        fs::remove_dir_all(dir.join(".git")).unwrap();
        fs::write(dir.join("leftover.txt"), "junk").unwrap();

        let repo = cache.acquire(&remote.uri(), &Credentials::Anonymous).unwrap();
        assert_eq!(repo.current_branch().unwrap(), Some("master".to_string()));
        assert!(!repo.root().join("leftover.txt").exists());
        assert_eq!(fs::read_to_string(repo.root().join("a.txt")).unwrap(), "one");
    }

    #[test]
    fn test_acquire_corrupt_clone_with_remote_gone() {
        let remote = RemoteFixture::new();
        remote.commit("master", &[("a.txt", "one")]);
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp);

        let dir = cache.acquire(&remote.uri(), &Credentials::Anonymous).unwrap().root().to_path_buf();
        fs::remove_dir_all(dir.join(".git")).unwrap();
        remote.destroy();

        let result = cache.acquire(&remote.uri(), &Credentials::Anonymous);
        assert!(matches!(result, Err(Error::RemoteAccess(_))));

        // Still broken on the next call, and still a single failed attempt
        let result = cache.acquire(&remote.uri(), &Credentials::Anonymous);
        assert!(matches!(result, Err(Error::RemoteAccess(_))));
    }

    #[test]
    fn test_acquire_replaces_stray_file() {
        let remote = RemoteFixture::new();
        remote.commit("master", &[("a.txt", "one")]);
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp);

        fs::write(cache.repo_dir(&remote.uri()), "not a clone").unwrap();
        let repo = cache.acquire(&remote.uri(), &Credentials::Anonymous).unwrap();

        assert!(repo.root().is_dir());
        assert_eq!(fs::read_to_string(repo.root().join("a.txt")).unwrap(), "one");
    }

    #[test]
    fn test_acquire_unreachable_remote() {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp);
        let missing = temp.path().join("no-such-remote.git");

        let result = cache.acquire(missing.to_str().unwrap(), &Credentials::Anonymous);
        assert!(matches!(result, Err(Error::RemoteAccess(_))));
    }
}
