//! Opened clone of a remote repository

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use git2::{BranchType, ErrorCode, Oid, Repository};

use super::remote::Transfer;
use crate::{Credentials, Error, Result};

const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(120);

/// A cached clone of one remote repository
///
/// The handle owns the libgit2 repository; the branch it is on is never
/// stored here and is always read back from disk.
pub struct GitRepo {
    /// The underlying git2 repository
    repo: Repository,
    /// Path to the working directory
    root: PathBuf,
    /// URI the clone was made from
    uri: String,
    /// Name of the tracked remote
    remote: String,
    /// Deadline for each fetch/push made through this handle
    network_timeout: Duration,
}

impl std::fmt::Debug for GitRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitRepo")
            .field("root", &self.root)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl GitRepo {
    /// Open the clone at `path` exactly; no upward discovery
    ///
    /// Fails with [`Error::RepositoryState`] when `.git` is missing or invalid,
    /// which the cache treats as a corrupt clone.
    pub fn open(path: impl AsRef<Path>, uri: &str, remote: &str) -> Result<Self> {
        let path = path.as_ref();

        let repo = Repository::open(path).map_err(|e| {
            Error::state(format!("Not a git repository: {}", path.display()), e)
        })?;

        let root = repo
            .workdir()
            .ok_or_else(|| {
                Error::RepositoryState("Bare repositories are not supported".to_string())
            })?
            .to_path_buf();

        Ok(Self {
            repo,
            root,
            uri: uri.to_string(),
            remote: remote.to_string(),
            network_timeout: DEFAULT_NETWORK_TIMEOUT,
        })
    }

    /// Use a different deadline for network transfers
    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    /// Start a network transfer against this clone's remote
    pub(crate) fn transfer<'a>(&'a self, credentials: &'a Credentials) -> Transfer<'a> {
        Transfer::new(credentials, &self.remote, self.network_timeout)
    }

    /// Get the working directory path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// URI this clone mirrors
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Name of the tracked remote
    pub fn remote_name(&self) -> &str {
        &self.remote
    }

    /// Get the current branch name
    ///
    /// Returns the branch HEAD points at even when it has no commits yet;
    /// `None` only for a detached HEAD.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let head = match self.repo.head() {
            Ok(h) => h,
            Err(e) if e.code() == ErrorCode::UnbornBranch => {
                let head = self
                    .repo
                    .find_reference("HEAD")
                    .map_err(|e| Error::state("Failed to read HEAD", e))?;
                return Ok(head
                    .symbolic_target()
                    .and_then(|t| t.strip_prefix("refs/heads/"))
                    .map(|s| s.to_string()));
            }
            Err(e) => return Err(Error::state("Failed to get HEAD", e)),
        };

        if head.is_branch() {
            Ok(head.shorthand().map(|s| s.to_string()))
        } else {
            // Detached HEAD
            Ok(None)
        }
    }

    /// Commit HEAD points at, `None` for an unborn branch
    pub fn head_commit(&self) -> Result<Option<Oid>> {
        match self.repo.head() {
            Ok(head) => Ok(head.target()),
            Err(e) if e.code() == ErrorCode::UnbornBranch => Ok(None),
            Err(e) => Err(Error::state("Failed to get HEAD", e)),
        }
    }

    /// Whether a local branch exists
    pub fn has_local_branch(&self, name: &str) -> bool {
        self.repo.find_branch(name, BranchType::Local).is_ok()
    }

    /// Tip of the remote-tracking branch `<remote>/<name>`, if fetched
    pub fn remote_branch_tip(&self, name: &str) -> Option<Oid> {
        self.repo
            .refname_to_id(&format!("refs/remotes/{}/{}", self.remote, name))
            .ok()
    }

    /// Tip of the local branch `name`, if it exists
    pub fn local_branch_tip(&self, name: &str) -> Option<Oid> {
        self.repo.refname_to_id(&format!("refs/heads/{}", name)).ok()
    }

    /// Resolve a repository-relative path inside the working directory
    ///
    /// Rejects absolute paths, `..` components and anything under `.git`.
    /// Symlinks anywhere along the path are refused as well, since a tracked
    /// link may point outside the clone. An empty path resolves to the
    /// working directory itself.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let normalized = normalize_path(relative)?;

        let mut current = self.root.clone();
        for component in normalized.components() {
            current.push(component);
            match std::fs::symlink_metadata(&current) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(Error::InvalidPath(format!(
                        "{}: goes through a symbolic link",
                        relative
                    )));
                }
                Ok(_) => {}
                // Nothing below a missing component exists yet
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => {
                    return Err(Error::storage(format!("Cannot stat {}", current.display()), e))
                }
            }
        }

        Ok(self.root.join(normalized))
    }

    /// Get access to the underlying git2 repository
    pub fn inner(&self) -> &Repository {
        &self.repo
    }
}

/// Normalise a repository-relative path, refusing anything outside the tree
pub fn normalize_path(relative: &str) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();

    for component in Path::new(relative.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => {
                if normalized.as_os_str().is_empty() && part == ".git" {
                    return Err(Error::InvalidPath(format!(
                        "{}: repository metadata is not accessible",
                        relative
                    )));
                }
                normalized.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::InvalidPath(format!(
                    "{}: path must stay inside the repository",
                    relative
                )));
            }
        }
    }

    Ok(normalized)
}
