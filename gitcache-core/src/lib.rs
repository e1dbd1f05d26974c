//! gitcache core - local clone cache for serving files from remote git repositories
//!
//! This crate keeps one working copy per remote URI on disk and performs
//! read, write (commit and push) and list operations against any branch of
//! it, serialising callers that touch the same repository.

pub mod config;
pub mod credentials;
pub mod error;
pub mod git;
pub mod lock;
pub mod ops;
pub mod secrets;

#[cfg(test)]
mod test_support;

pub use config::{CacheConfig, Config, GitConfig};
pub use credentials::{CredentialStore, Credentials};
pub use error::{Error, Result};
pub use git::{GitRepo, PullOutcome, RepositoryCache};
pub use lock::{FileLock, RepoLocks};
pub use ops::{Entry, EntryKind, FileOperations};
pub use secrets::Secrets;
