//! Branch state machine for cached clones
//!
//! `prepare` drives a clone onto a target branch and leaves the working tree
//! identical to the branch's committed tree. The branch a clone is on is read
//! from disk on every call; nothing here remembers previous calls.

use std::fs;
use std::path::Path;

use git2::build::CheckoutBuilder;
use git2::{ErrorCode, Oid, Reference, ResetType, Status, StatusOptions};
use tracing::{debug, info, warn};

use super::remote::{Push, Transfer};
use super::repo::GitRepo;
use crate::{Credentials, Error, Result};

/// Namespace for commits the remote refused
pub const UNPUBLISHED_REFS: &str = "refs/gitcache/unpublished";

impl GitRepo {
    /// Put the clone on `target` with a pristine working tree
    ///
    /// Commits on `target` that the remote has not confirmed are pushed first,
    /// or parked under [`UNPUBLISHED_REFS`] when the remote refuses them.
    pub fn prepare(&self, target: &str, credentials: &Credentials) -> Result<()> {
        validate_branch_name(target)?;
        let transfer = self.transfer(credentials);

        match self.current_branch()? {
            Some(current) if current == target => {
                debug!(branch = target, "Already on branch, discarding local changes");
                self.protect_unpublished(target, &transfer)?;
                self.discard_local_changes()
            }
            current => {
                debug!(from = ?current, to = target, "Switching branch");
                self.switch_to_branch_with(target, &transfer)
            }
        }
    }

    /// Check out `target`, creating it from the remote or from scratch
    ///
    /// A local branch is checked out as is. Otherwise a tracking branch is
    /// made from `<remote>/<target>`; when the remote has no such branch a new
    /// one is created from HEAD and published.
    pub fn switch_to_branch(&self, target: &str, credentials: &Credentials) -> Result<()> {
        validate_branch_name(target)?;
        self.switch_to_branch_with(target, &self.transfer(credentials))
    }

    /// Create `name` from HEAD, check it out and push it
    ///
    /// An existing local branch of that name is reused.
    pub fn create_branch(&self, name: &str, credentials: &Credentials) -> Result<()> {
        validate_branch_name(name)?;
        self.create_branch_with(name, &self.transfer(credentials))
    }

    /// Hard-reset tracked files to HEAD and delete everything untracked
    pub fn discard_local_changes(&self) -> Result<()> {
        let repo = self.inner();

        if let Some(head) = self.head_commit()? {
            let object = repo
                .find_object(head, None)
                .map_err(|e| Error::state("Cannot load HEAD commit", e))?;
            repo.reset(&object, ResetType::Hard, None)
                .map_err(|e| Error::state("Hard reset failed", e))?;
        }

        self.remove_untracked()
    }

    /// Commits parked for `branch` after the remote refused them
    pub fn unpublished_commits(&self, branch: &str) -> Result<Vec<Oid>> {
        let glob = format!("{}/{}/*", UNPUBLISHED_REFS, branch);
        let refs = self
            .inner()
            .references_glob(&glob)
            .map_err(|e| Error::state("Cannot list unpublished commits", e))?;

        let mut commits = Vec::new();
        for reference in refs {
            let reference =
                reference.map_err(|e| Error::state("Cannot read unpublished ref", e))?;
            if let Some(oid) = reference.target() {
                commits.push(oid);
            }
        }
        Ok(commits)
    }

    /// Keep the local tip of `branch` reachable under [`UNPUBLISHED_REFS`]
    pub(crate) fn park_unpublished(&self, branch: &str) -> Result<Option<String>> {
        let Some(tip) = self.local_branch_tip(branch) else {
            return Ok(None);
        };

        let name = format!("{}/{}/{}", UNPUBLISHED_REFS, branch, tip);
        self.inner()
            .reference(&name, tip, true, "gitcache: keep commit refused by remote")
            .map_err(|e| Error::state(format!("Cannot create {}", name), e))?;

        warn!(branch, commit = %tip, backup = %name, "Kept unpublished commit");
        Ok(Some(name))
    }

    fn switch_to_branch_with(&self, target: &str, transfer: &Transfer<'_>) -> Result<()> {
        // Leftovers from the branch being left must not follow us
        self.discard_local_changes()?;

        if self.has_local_branch(target) {
            self.checkout(target)?;
            self.protect_unpublished(target, transfer)?;
        } else if let Some(tip) = self.remote_branch_tip(target) {
            self.create_tracking_branch(target, tip)?;
            self.checkout(target)?;
        } else {
            info!(branch = target, "Branch missing on remote, creating it");
            self.create_branch_with(target, transfer)?;
        }

        self.discard_local_changes()
    }

    fn create_branch_with(&self, name: &str, transfer: &Transfer<'_>) -> Result<()> {
        let repo = self.inner();

        if self.has_local_branch(name) {
            debug!(branch = name, "Branch already exists locally");
        } else {
            let head = self.head_commit()?.ok_or_else(|| {
                Error::RepositoryState(format!(
                    "Cannot create branch '{}' in a repository without commits",
                    name
                ))
            })?;
            let commit = repo
                .find_commit(head)
                .map_err(|e| Error::state("Cannot load HEAD commit", e))?;
            repo.branch(name, &commit, false)
                .map_err(|e| Error::state(format!("Cannot create branch '{}'", name), e))?;
        }

        self.checkout(name)?;

        match transfer.push_branch(repo, name)? {
            Push::Published(oid) => {
                info!(branch = name, commit = %oid, "Published new branch");
            }
            Push::Rejected(reason) => {
                // Someone else created the branch first; theirs wins
                info!(branch = name, %reason, "Branch was created concurrently, adopting remote");
                transfer.fetch(repo)?;
                let tip = self.remote_branch_tip(name).ok_or_else(|| {
                    Error::RemoteAccess(format!("Push of new branch '{}' refused: {}", name, reason))
                })?;
                if let Some(local) = self.local_branch_tip(name) {
                    if self.is_ahead(local, tip)? {
                        self.park_unpublished(name)?;
                    }
                }
                self.move_branch(name, tip)?;
            }
        }

        self.set_upstream(name)
    }

    /// Push commits the remote has not confirmed; park them if it refuses
    ///
    /// Network and authentication failures propagate so nothing is dropped
    /// while the remote is unreachable.
    fn protect_unpublished(&self, branch: &str, transfer: &Transfer<'_>) -> Result<()> {
        let Some(local) = self.local_branch_tip(branch) else {
            return Ok(());
        };

        match self.remote_branch_tip(branch) {
            Some(remote) => {
                if !self.is_ahead(local, remote)? {
                    return Ok(());
                }
            }
            None => {
                if !self.has_commits_unknown_to_remote(local)? {
                    return Ok(());
                }
                if self.has_upstream(branch)? {
                    // Deleted on the remote; pushing would bring it back
                    warn!(branch, commit = %local, "Branch was deleted on the remote");
                    self.park_unpublished(branch)?;
                    return Ok(());
                }
            }
        }

        warn!(branch, commit = %local, "Branch has unpublished commits, pushing them");
        match transfer.push_branch(self.inner(), branch)? {
            Push::Published(_) => Ok(()),
            Push::Rejected(reason) => {
                warn!(branch, %reason, "Remote refused unpublished commits");
                self.park_unpublished(branch)?;
                transfer.fetch(self.inner())?;
                match self.remote_branch_tip(branch) {
                    Some(remote) => self.move_branch(branch, remote),
                    None => Err(Error::RemoteAccess(reason)),
                }
            }
        }
    }

    /// Whether `local` has commits that `remote` does not contain
    fn is_ahead(&self, local: Oid, remote: Oid) -> Result<bool> {
        if local == remote {
            return Ok(false);
        }
        let (ahead, _behind) = self
            .inner()
            .graph_ahead_behind(local, remote)
            .map_err(|e| Error::state("Cannot compare with remote branch", e))?;
        Ok(ahead > 0)
    }

    /// Whether `local` reaches commits no remote-tracking ref contains
    fn has_commits_unknown_to_remote(&self, local: Oid) -> Result<bool> {
        let mut walk = self
            .inner()
            .revwalk()
            .map_err(|e| Error::state("Cannot walk history", e))?;
        walk.push(local)
            .and_then(|_| walk.hide_glob(&format!("refs/remotes/{}/*", self.remote_name())))
            .map_err(|e| Error::state("Cannot walk history", e))?;

        match walk.next() {
            Some(Ok(_)) => Ok(true),
            Some(Err(e)) => Err(Error::state("Cannot walk history", e)),
            None => Ok(false),
        }
    }

    /// Whether `branch` was ever set to track a remote branch
    fn has_upstream(&self, branch: &str) -> Result<bool> {
        let mut config = self
            .inner()
            .config()
            .map_err(|e| Error::state("Cannot read repository config", e))?;
        let snapshot = config
            .snapshot()
            .map_err(|e| Error::state("Cannot read repository config", e))?;
        Ok(snapshot
            .get_string(&format!("branch.{}.merge", branch))
            .is_ok())
    }

    fn create_tracking_branch(&self, name: &str, tip: Oid) -> Result<()> {
        let commit = self
            .inner()
            .find_commit(tip)
            .map_err(|e| Error::state(format!("Cannot load {}/{}", self.remote_name(), name), e))?;
        self.inner()
            .branch(name, &commit, false)
            .map_err(|e| Error::state(format!("Cannot create branch '{}'", name), e))?;
        self.set_upstream(name)
    }

    fn set_upstream(&self, name: &str) -> Result<()> {
        if self.remote_branch_tip(name).is_none() {
            return Ok(());
        }

        let mut branch = self
            .inner()
            .find_branch(name, git2::BranchType::Local)
            .map_err(|e| Error::state(format!("Branch '{}' vanished", name), e))?;
        branch
            .set_upstream(Some(&format!("{}/{}", self.remote_name(), name)))
            .map_err(|e| Error::state(format!("Cannot set upstream of '{}'", name), e))
    }

    fn checkout(&self, name: &str) -> Result<()> {
        let repo = self.inner();
        let refname = format!("refs/heads/{}", name);
        let target = repo
            .revparse_single(&refname)
            .map_err(|e| Error::state(format!("Cannot resolve {}", refname), e))?;

        repo.checkout_tree(&target, Some(CheckoutBuilder::new().safe()))
            .map_err(|e| match e.code() {
                ErrorCode::Conflict | ErrorCode::MergeConflict => Error::RepositoryState(format!(
                    "Checkout of '{}' conflicts with the working tree: {}",
                    name,
                    e.message()
                )),
                _ => Error::state(format!("Checkout of '{}' failed", name), e),
            })?;

        repo.set_head(&refname)
            .map_err(|e| Error::state(format!("Cannot point HEAD at {}", refname), e))
    }

    /// Point local `branch` at `target`; the working tree follows on the next reset
    fn move_branch(&self, branch: &str, target: Oid) -> Result<()> {
        let refname = format!("refs/heads/{}", branch);
        let mut reference: Reference<'_> = self
            .inner()
            .find_reference(&refname)
            .map_err(|e| Error::state(format!("Cannot resolve {}", refname), e))?;
        reference
            .set_target(target, "gitcache: follow remote")
            .map_err(|e| Error::state(format!("Cannot move {}", refname), e))?;
        Ok(())
    }

    fn remove_untracked(&self) -> Result<()> {
        let mut options = StatusOptions::new();
        options
            .include_untracked(true)
            .recurse_untracked_dirs(false)
            .include_ignored(true)
            .recurse_ignored_dirs(false)
            .exclude_submodules(true);

        let statuses = self
            .inner()
            .statuses(Some(&mut options))
            .map_err(|e| Error::state("Cannot read working tree status", e))?;

        let mut doomed = Vec::new();
        for entry in statuses.iter() {
            if !entry.status().intersects(Status::WT_NEW | Status::IGNORED) {
                continue;
            }
            match entry.path() {
                Some(path) => doomed.push(self.root().join(path)),
                None => warn!("Skipping untracked path that is not valid UTF-8"),
            }
        }
        drop(statuses);

        for path in doomed {
            remove_path(&path)?;
        }

        prune_empty_dirs(self.root(), true)?;
        Ok(())
    }
}

/// Reject names git would not accept as `refs/heads/<name>`
pub fn validate_branch_name(name: &str) -> Result<()> {
    if name.is_empty() || !Reference::is_valid_name(&format!("refs/heads/{}", name)) {
        return Err(Error::RepositoryState(format!(
            "Invalid branch name: '{}'",
            name
        )));
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::storage(format!("Cannot stat {}", path.display()), e)),
    };

    let removed = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    removed.map_err(|e| Error::storage(format!("Cannot remove {}", path.display()), e))
}

/// Remove directories left empty; git cannot track them so they are untracked too
///
/// Returns whether `dir` itself ended up empty.
fn prune_empty_dirs(dir: &Path, is_root: bool) -> Result<bool> {
    let entries =
        fs::read_dir(dir).map_err(|e| Error::storage(format!("Cannot read {}", dir.display()), e))?;

    let mut empty = true;
    for entry in entries {
        let entry =
            entry.map_err(|e| Error::storage(format!("Cannot read {}", dir.display()), e))?;
        if is_root && entry.file_name() == ".git" {
            empty = false;
            continue;
        }

        let file_type = entry
            .file_type()
            .map_err(|e| Error::storage(format!("Cannot stat {}", entry.path().display()), e))?;
        if file_type.is_dir() && prune_empty_dirs(&entry.path(), false)? {
            fs::remove_dir(entry.path()).map_err(|e| {
                Error::storage(format!("Cannot remove {}", entry.path().display()), e)
            })?;
        } else {
            empty = false;
        }
    }

    Ok(empty)
}
