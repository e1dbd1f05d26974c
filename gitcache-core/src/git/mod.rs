//! Git operations for gitcache
//!
//! This module provides the clone cache, the branch state machine that
//! prepares a clone for use, and the pull/commit/push primitives.

mod branch;
mod cache;
mod remote;
mod repo;
mod sync;

pub use branch::{validate_branch_name, UNPUBLISHED_REFS};
pub use cache::{dir_name, RepositoryCache};
pub use remote::{init_transport_timeouts, redact, Push};
pub use repo::{normalize_path, GitRepo};
pub use sync::PullOutcome;
