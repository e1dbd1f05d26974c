//! Pulling and committing on a prepared clone

use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

use git2::build::CheckoutBuilder;
use git2::{ObjectType, Oid};
use tracing::{debug, info};

use super::repo::GitRepo;
use crate::{Credentials, Error, Result};

/// Result of a fast-forward pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// Already at the remote tip, or the remote has no such branch
    UpToDate,
    /// Moved forward to the given commit
    FastForwarded(Oid),
}

impl GitRepo {
    /// Fetch and fast-forward `branch` to its remote counterpart
    ///
    /// A branch that has diverged from the remote is a
    /// [`Error::RepositoryState`]; nothing is merged.
    pub fn pull_fast_forward(&self, branch: &str, credentials: &Credentials) -> Result<PullOutcome> {
        let repo = self.inner();
        self.transfer(credentials).fetch(repo)?;

        let Some(remote_tip) = self.remote_branch_tip(branch) else {
            debug!(branch, "No remote branch, nothing to pull");
            return Ok(PullOutcome::UpToDate);
        };

        let annotated = repo
            .find_annotated_commit(remote_tip)
            .map_err(|e| Error::state("Cannot load fetched commit", e))?;
        let (analysis, _) = repo
            .merge_analysis(&[&annotated])
            .map_err(|e| Error::state("Merge analysis failed", e))?;

        if analysis.is_up_to_date() {
            return Ok(PullOutcome::UpToDate);
        }

        if !analysis.is_fast_forward() {
            return Err(Error::RepositoryState(format!(
                "Branch '{}' has diverged from {}/{} and cannot be fast-forwarded",
                branch,
                self.remote_name(),
                branch
            )));
        }

        let refname = format!("refs/heads/{}", branch);
        let mut reference = repo
            .find_reference(&refname)
            .map_err(|e| Error::state(format!("Cannot resolve {}", refname), e))?;
        reference
            .set_target(remote_tip, "gitcache: fast-forward")
            .map_err(|e| Error::state(format!("Cannot move {}", refname), e))?;
        repo.checkout_head(Some(CheckoutBuilder::new().force()))
            .map_err(|e| Error::state("Checkout after fast-forward failed", e))?;

        info!(branch, commit = %remote_tip, "Fast-forwarded");
        Ok(PullOutcome::FastForwarded(remote_tip))
    }

    /// Write `content` at `relative`, stage only that path and commit it
    ///
    /// Author and committer are both `committer` with an empty email.
    pub fn commit_path(
        &self,
        relative: &str,
        content: &[u8],
        message: &str,
        committer: &str,
    ) -> Result<Oid> {
        let relative_path = super::repo::normalize_path(relative)?;
        if relative_path.as_os_str().is_empty() {
            return Err(Error::InvalidPath(format!("{}: not a file path", relative)));
        }
        let identity = identity(committer)?;

        let full = self.resolve(relative)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::storage(format!("Cannot create {}", parent.display()), e)
            })?;
        }
        fs::write(&full, content)
            .map_err(|e| Error::storage(format!("Cannot write {}", full.display()), e))?;

        let repo = self.inner();
        let mut index = repo
            .index()
            .map_err(|e| Error::state("Cannot open index", e))?;
        index
            .add_path(&relative_path)
            .map_err(|e| Error::state(format!("Cannot stage {}", relative), e))?;
        index
            .write()
            .map_err(|e| Error::state("Cannot write index", e))?;
        let tree = index
            .write_tree()
            .map_err(|e| Error::state("Cannot write tree", e))?;

        // libgit2 refuses signatures without an email, so the object is
        // written by hand
        let mut raw = format!("tree {}\n", tree);
        if let Some(parent) = self.head_commit()? {
            raw.push_str(&format!("parent {}\n", parent));
        }
        raw.push_str(&format!("author {}\n", identity));
        raw.push_str(&format!("committer {}\n\n", identity));
        raw.push_str(message);

        let oid = repo
            .odb()
            .and_then(|odb| odb.write(ObjectType::Commit, raw.as_bytes()))
            .map_err(|e| Error::state("Cannot write commit", e))?;

        let summary = format!("commit: {}", message.lines().next().unwrap_or_default());
        match self.current_branch()? {
            Some(branch) => {
                let refname = format!("refs/heads/{}", branch);
                repo.reference(&refname, oid, true, &summary)
                    .map_err(|e| Error::state(format!("Cannot move {}", refname), e))?;
            }
            None => repo
                .set_head_detached(oid)
                .map_err(|e| Error::state("Cannot move detached HEAD", e))?,
        }

        debug!(path = relative, commit = %oid, "Committed file");
        Ok(oid)
    }
}

/// `<name> <> <seconds> +0000` as written in commit headers
fn identity(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() || name.contains(['<', '>', '\n', '\0']) {
        return Err(Error::RepositoryState(format!(
            "Invalid committer name '{}'",
            name
        )));
    }

    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    Ok(format!("{} <> {} +0000", name, seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RemoteFixture;
    use crate::RepositoryCache;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn clone(remote: &RemoteFixture, temp: &TempDir) -> GitRepo {
        let cache = RepositoryCache::new(temp.path(), "origin", Duration::from_secs(30)).unwrap();
        let repo = cache.acquire(&remote.uri(), &Credentials::Anonymous).unwrap();
        repo.prepare("master", &Credentials::Anonymous).unwrap();
        repo
    }

    #[test]
    fn test_pull_fast_forwards() {
        let remote = RemoteFixture::new();
        remote.commit("master", &[("a.txt", "one")]);
        let temp = TempDir::new().unwrap();
        let repo = clone(&remote, &temp);

        let tip = remote.commit("master", &[("b.txt", "two")]);
        let outcome = repo.pull_fast_forward("master", &Credentials::Anonymous).unwrap();

        assert_eq!(outcome, PullOutcome::FastForwarded(tip));
        assert_eq!(repo.head_commit().unwrap(), Some(tip));
        assert_eq!(fs::read_to_string(repo.root().join("b.txt")).unwrap(), "two");

        let again = repo.pull_fast_forward("master", &Credentials::Anonymous).unwrap();
        assert_eq!(again, PullOutcome::UpToDate);
    }

    #[test]
    fn test_pull_missing_remote_branch() {
        let remote = RemoteFixture::new();
        remote.commit("master", &[("a.txt", "one")]);
        let temp = TempDir::new().unwrap();
        let repo = clone(&remote, &temp);

        let outcome = repo.pull_fast_forward("nowhere", &Credentials::Anonymous).unwrap();
        assert_eq!(outcome, PullOutcome::UpToDate);
    }

    #[test]
    fn test_pull_diverged_is_state_error() {
        let remote = RemoteFixture::new();
        remote.commit("master", &[("a.txt", "one")]);
        let temp = TempDir::new().unwrap();
        let repo = clone(&remote, &temp);

        repo.commit_path("local.txt", b"mine", "local", "tester").unwrap();
        remote.commit("master", &[("remote.txt", "theirs")]);

        let result = repo.pull_fast_forward("master", &Credentials::Anonymous);
        assert!(matches!(result, Err(Error::RepositoryState(_))));
    }

    #[test]
    fn test_commit_path_stages_only_that_file() {
        let remote = RemoteFixture::new();
        remote.commit("master", &[("a.txt", "one")]);
        let temp = TempDir::new().unwrap();
        let repo = clone(&remote, &temp);

        fs::write(repo.root().join("bystander.txt"), "not me").unwrap();
        let before = repo.head_commit().unwrap().unwrap();
        let oid = repo
            .commit_path("deep/nested/new.txt", b"content", "Add file", "Jane Doe")
            .unwrap();

        let commit = repo.inner().find_commit(oid).unwrap();
        assert_eq!(commit.message(), Some("Add file"));
        assert_eq!(commit.author().name(), Some("Jane Doe"));
        assert_eq!(commit.author().email(), Some(""));
        assert_eq!(commit.committer().name(), Some("Jane Doe"));
        assert_eq!(commit.committer().email(), Some(""));
        assert_eq!(commit.parent_ids().collect::<Vec<_>>(), vec![before]);
        assert_eq!(repo.head_commit().unwrap(), Some(oid));
        assert_eq!(repo.local_branch_tip("master"), Some(oid));

        let tree = commit.tree().unwrap();
        assert!(tree.get_path(Path::new("deep/nested/new.txt")).is_ok());
        assert!(tree.get_path(Path::new("bystander.txt")).is_err());
    }

    #[test]
    fn test_commit_path_rejects_escape() {
        let remote = RemoteFixture::new();
        remote.commit("master", &[("a.txt", "one")]);
        let temp = TempDir::new().unwrap();
        let repo = clone(&remote, &temp);

        let result = repo.commit_path("../outside.txt", b"x", "nope", "tester");
        assert!(matches!(result, Err(Error::InvalidPath(_))));
        let result = repo.commit_path("", b"x", "nope", "tester");
        assert!(matches!(result, Err(Error::InvalidPath(_))));
    }

    #[test]
    fn test_commit_path_rejects_bad_committer() {
        let remote = RemoteFixture::new();
        remote.commit("master", &[("a.txt", "one")]);
        let temp = TempDir::new().unwrap();
        let repo = clone(&remote, &temp);

        for name in ["", "   ", "Eve <eve@example.com>", "two\nlines"] {
            let result = repo.commit_path("x.txt", b"x", "nope", name);
            assert!(matches!(result, Err(Error::RepositoryState(_))), "{:?}", name);
        }
        assert_eq!(repo.head_commit().unwrap(), remote.tip("master"));
    }

    #[cfg(unix)]
    #[test]
    fn test_commit_path_refuses_tracked_symlink() {
        let outside = TempDir::new().unwrap();
        let remote = RemoteFixture::new();
        remote.commit("master", &[("a.txt", "one")]);
        remote.commit_symlink("master", "esc", outside.path());
        let temp = TempDir::new().unwrap();
        let repo = clone(&remote, &temp);
        assert!(fs::symlink_metadata(repo.root().join("esc")).unwrap().file_type().is_symlink());

        let result = repo.commit_path("esc/planted.txt", b"x", "nope", "tester");
        assert!(matches!(result, Err(Error::InvalidPath(_))));
        assert!(!outside.path().join("planted.txt").exists());
    }
}
