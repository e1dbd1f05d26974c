//! Error types for gitcache

use thiserror::Error;

/// Result type alias for gitcache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for gitcache operations
///
/// Every git subcommand failure is reported as one of the first four kinds;
/// callers never see libgit2's own error classes.
#[derive(Error, Debug)]
pub enum Error {
    /// Network failure, rejected authentication, non-fast-forward push or a
    /// transfer that ran past its deadline
    #[error("Remote access error: {0}")]
    RemoteAccess(String),

    /// Invalid branch name, unresolvable checkout conflict or a branch that
    /// can no longer be fast-forwarded
    #[error("Repository state error: {0}")]
    RepositoryState(String),

    /// Filesystem failure in the local cache
    #[error("Local storage error: {0}")]
    LocalStorage(String),

    /// Requested path does not exist on the branch
    #[error("Not found: {0}")]
    NotFound(String),

    /// Path is absolute, escapes the working copy, or points into `.git`
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// No credentials are registered for the session
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Wrap a libgit2 failure from a network call
    pub(crate) fn remote(context: impl std::fmt::Display, err: git2::Error) -> Self {
        Error::RemoteAccess(format!("{}: {}", context, err.message()))
    }

    /// Wrap a libgit2 failure from a local repository operation
    pub(crate) fn state(context: impl std::fmt::Display, err: git2::Error) -> Self {
        Error::RepositoryState(format!("{}: {}", context, err.message()))
    }

    /// Wrap a filesystem failure
    pub(crate) fn storage(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        Error::LocalStorage(format!("{}: {}", context, err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::LocalStorage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_errors_keep_context() {
        let err = Error::remote("push refs/heads/master", git2::Error::from_str("rejected"));
        assert!(matches!(err, Error::RemoteAccess(_)));
        assert_eq!(
            err.to_string(),
            "Remote access error: push refs/heads/master: rejected"
        );

        let err = Error::state("checkout", git2::Error::from_str("conflict"));
        assert!(matches!(err, Error::RepositoryState(_)));
        assert!(err.to_string().contains("checkout: conflict"));
    }

    #[test]
    fn test_io_errors_are_local_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io.into();
        assert!(matches!(err, Error::LocalStorage(_)));
    }
}
