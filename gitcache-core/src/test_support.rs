//! Local bare remotes for tests
//!
//! A fixture owns a bare repository plus a scratch clone used to author
//! commits, so tests never touch the network.

use std::path::{Path, PathBuf};

use git2::build::CheckoutBuilder;
use git2::{Oid, Repository, RepositoryInitOptions, Signature};
use tempfile::TempDir;

pub struct RemoteFixture {
    _temp: TempDir,
    bare: PathBuf,
    author: Repository,
}

impl RemoteFixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let bare = temp.path().join("remote.git");
        let mut opts = RepositoryInitOptions::new();
        opts.bare(true).initial_head("master");
        Repository::init_opts(&bare, &opts).unwrap();

        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("master");
        let author = Repository::init_opts(temp.path().join("author"), &opts).unwrap();
        author.remote("origin", bare.to_str().unwrap()).unwrap();

        Self {
            _temp: temp,
            bare,
            author,
        }
    }

    pub fn uri(&self) -> String {
        self.bare.to_string_lossy().into_owned()
    }

    /// Commit `files` on top of the remote's `branch` (or master when the
    /// branch is new) and push it
    pub fn commit(&self, branch: &str, files: &[(&str, &str)]) -> Oid {
        self.commit_with(branch, |workdir, index| {
            for (path, content) in files {
                let full = workdir.join(path);
                std::fs::create_dir_all(full.parent().unwrap()).unwrap();
                std::fs::write(&full, content).unwrap();
                index.add_path(Path::new(path)).unwrap();
            }
        })
    }

    /// Commit a symbolic link at `path` pointing to `target`
    #[cfg(unix)]
    pub fn commit_symlink(&self, branch: &str, path: &str, target: &Path) -> Oid {
        self.commit_with(branch, |workdir, index| {
            std::os::unix::fs::symlink(target, workdir.join(path)).unwrap();
            index.add_path(Path::new(path)).unwrap();
        })
    }

    /// Delete `branch` on the remote, as a collaborator would
    pub fn delete_branch(&self, branch: &str) {
        let bare = Repository::open_bare(&self.bare).unwrap();
        bare.find_reference(&format!("refs/heads/{}", branch))
            .unwrap()
            .delete()
            .unwrap();
    }

    /// Remove the remote entirely so every later transfer fails
    pub fn destroy(&self) {
        std::fs::remove_dir_all(&self.bare).unwrap();
    }

    fn commit_with(&self, branch: &str, stage: impl FnOnce(&Path, &mut git2::Index)) -> Oid {
        let repo = &self.author;
        repo.find_remote("origin")
            .unwrap()
            .fetch(&["+refs/heads/*:refs/remotes/origin/*"], None, None)
            .unwrap();

        let base = repo
            .refname_to_id(&format!("refs/remotes/origin/{}", branch))
            .or_else(|_| repo.refname_to_id("refs/remotes/origin/master"))
            .ok();

        let local = format!("refs/heads/{}", branch);
        match base {
            Some(oid) => {
                repo.reference(&local, oid, true, "fixture").unwrap();
                repo.set_head(&local).unwrap();
                repo.checkout_head(Some(CheckoutBuilder::new().force().remove_untracked(true)))
                    .unwrap();
            }
            None => repo.set_head(&local).unwrap(),
        }

        let workdir = repo.workdir().unwrap().to_path_buf();
        let mut index = repo.index().unwrap();
        stage(&workdir, &mut index);
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();

        let sig = Signature::now("fixture", "fixture@example.com").unwrap();
        let parents: Vec<_> = base
            .map(|oid| repo.find_commit(oid).unwrap())
            .into_iter()
            .collect();
        let parent_refs: Vec<_> = parents.iter().collect();
        let oid = repo
            .commit(Some("HEAD"), &sig, &sig, "fixture commit", &tree, &parent_refs)
            .unwrap();

        let refspec = format!("{}:{}", local, local);
        repo.find_remote("origin")
            .unwrap()
            .push(&[refspec.as_str()], None)
            .unwrap();
        oid
    }

    /// Tip of `branch` on the remote
    pub fn tip(&self, branch: &str) -> Option<Oid> {
        let bare = Repository::open_bare(&self.bare).unwrap();
        let tip = bare.refname_to_id(&format!("refs/heads/{}", branch)).ok();
        tip
    }

    /// Contents of `path` on the remote's `branch`
    pub fn file(&self, branch: &str, path: &str) -> Option<String> {
        let bare = Repository::open_bare(&self.bare).unwrap();
        let commit = bare
            .find_reference(&format!("refs/heads/{}", branch))
            .ok()?
            .peel_to_commit()
            .ok()?;
        let entry = commit.tree().ok()?.get_path(Path::new(path)).ok()?;
        let blob = bare.find_blob(entry.id()).ok()?;
        let content = String::from_utf8_lossy(blob.content()).into_owned();
        Some(content)
    }

    /// Messages along the first-parent history of the remote's `branch`
    pub fn log(&self, branch: &str) -> Vec<String> {
        let bare = Repository::open_bare(&self.bare).unwrap();
        let mut walk = bare.revwalk().unwrap();
        walk.push_ref(&format!("refs/heads/{}", branch)).unwrap();
        walk.simplify_first_parent().unwrap();
        let messages = walk
            .map(|oid| {
                let commit = bare.find_commit(oid.unwrap()).unwrap();
                let message = commit.message().unwrap_or("").to_string();
                message
            })
            .collect();
        messages
    }
}

/// Files `<dir>/<prefix>0 .. <prefix>N-1` with distinct contents
pub fn numbered_files(dir: &str, prefix: &str, count: usize) -> Vec<(String, String)> {
    (0..count)
        .map(|i| (format!("{}/{}{}.dita", dir, prefix, i), format!("<topic id=\"{}\"/>", i)))
        .collect()
}

pub fn as_refs(files: &[(String, String)]) -> Vec<(&str, &str)> {
    files.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect()
}
