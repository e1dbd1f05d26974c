//! Network transfers: clone, fetch and push with per-call credentials
//!
//! Every transfer carries a deadline. libgit2 polls the progress callbacks
//! while data moves, and a callback returning `false` aborts the transfer,
//! which is how a stalled clone or fetch gets cancelled.

use std::cell::RefCell;
use std::os::raw::c_int;
use std::path::Path;
use std::rc::Rc;
use std::sync::Once;
use std::time::{Duration, Instant};

use git2::build::RepoBuilder;
use git2::{
    Cred, CredentialType, ErrorCode, FetchOptions, FetchPrune, Oid, PushOptions,
    RemoteCallbacks, Repository,
};
use tracing::{debug, warn};

use crate::{Credentials, Error, Result};

/// What the remote did with a pushed branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Push {
    /// The remote now has the commit
    Published(Oid),
    /// The remote refused the update (someone else pushed first)
    Rejected(String),
}

/// One network conversation with the remote
pub(crate) struct Transfer<'a> {
    credentials: &'a Credentials,
    remote_name: &'a str,
    timeout: Duration,
    deadline: Instant,
}

impl<'a> Transfer<'a> {
    pub fn new(credentials: &'a Credentials, remote_name: &'a str, timeout: Duration) -> Self {
        Self {
            credentials,
            remote_name,
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    /// Clone every branch of `uri` into `dir`
    pub fn clone_into(&self, uri: &str, dir: &Path) -> Result<Repository> {
        let remote_name = self.remote_name;
        let mut builder = RepoBuilder::new();
        builder.fetch_options(self.fetch_options());
        builder.remote_create(move |repo, _name, url| repo.remote(remote_name, url));

        builder
            .clone(uri, dir)
            .map_err(|e| self.failure(format!("Failed to clone {}", redact(uri)), e))
    }

    /// Fetch all branches, pruning remote-tracking refs that disappeared
    pub fn fetch(&self, repo: &Repository) -> Result<()> {
        let mut remote = repo.find_remote(self.remote_name).map_err(|e| {
            Error::state(format!("Remote '{}' not found", self.remote_name), e)
        })?;

        let mut options = self.fetch_options();
        options.prune(FetchPrune::On);

        remote
            .fetch(&[] as &[&str], Some(&mut options), None)
            .map_err(|e| self.failure(format!("Fetch from '{}' failed", self.remote_name), e))
    }

    /// Push a local branch to the branch of the same name on the remote
    ///
    /// A non-fast-forward rejection is an outcome, not an error, so callers can
    /// decide what happens to the commits the remote refused. On success the
    /// remote-tracking ref is moved to the pushed commit so the branch no
    /// longer counts as unpublished.
    pub fn push_branch(&self, repo: &Repository, branch: &str) -> Result<Push> {
        let local_ref = format!("refs/heads/{}", branch);
        let oid = repo
            .refname_to_id(&local_ref)
            .map_err(|e| Error::state(format!("Cannot resolve {}", local_ref), e))?;

        let mut remote = repo.find_remote(self.remote_name).map_err(|e| {
            Error::state(format!("Remote '{}' not found", self.remote_name), e)
        })?;

        let rejection: Rc<RefCell<Option<String>>> = Rc::default();
        let mut callbacks = self.callbacks();
        let seen = Rc::clone(&rejection);
        callbacks.push_update_reference(move |refname, status| {
            if let Some(reason) = status {
                *seen.borrow_mut() = Some(format!("{} rejected by remote: {}", refname, reason));
            }
            Ok(())
        });

        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);

        let refspec = format!("{}:{}", local_ref, local_ref);
        match remote.push(&[refspec.as_str()], Some(&mut options)) {
            Ok(()) => {}
            Err(e) if e.code() == ErrorCode::NotFastForward => {
                return Ok(Push::Rejected(e.message().to_string()));
            }
            Err(e) => return Err(self.failure(format!("Push of {} failed", local_ref), e)),
        }

        if let Some(reason) = rejection.borrow_mut().take() {
            return Ok(Push::Rejected(reason));
        }

        let tracking = format!("refs/remotes/{}/{}", self.remote_name, branch);
        repo.reference(&tracking, oid, true, "push: update tracking ref")
            .map_err(|e| Error::state(format!("Cannot update {}", tracking), e))?;

        debug!(branch, commit = %oid, "Pushed branch");
        Ok(Push::Published(oid))
    }

    fn fetch_options(&self) -> FetchOptions<'a> {
        let mut options = FetchOptions::new();
        options.remote_callbacks(self.callbacks());
        options
    }

    fn callbacks(&self) -> RemoteCallbacks<'a> {
        let credentials = self.credentials;
        let deadline = self.deadline;
        let mut callbacks = RemoteCallbacks::new();

        // libgit2 asks again after every rejected credential
        let mut offered = CredentialType::empty();
        callbacks.credentials(move |_url, username_from_url, allowed| {
            let username = username_from_url.unwrap_or("git");
            let plaintext = credentials.plaintext();

            match next_credential(allowed, &mut offered, plaintext.is_some()) {
                Some(kind) if kind == CredentialType::USER_PASS_PLAINTEXT => {
                    let (user, password) = plaintext.unwrap_or_default();
                    Cred::userpass_plaintext(user, password)
                }
                Some(kind) if kind == CredentialType::SSH_KEY => Cred::ssh_key_from_agent(username),
                Some(_) => Cred::username(username),
                None => Err(git2::Error::from_str("authentication rejected by remote")),
            }
        });

        callbacks.transfer_progress(move |_| Instant::now() < deadline);
        callbacks.sideband_progress(move |_| Instant::now() < deadline);
        // Push progress callbacks cannot abort, so the deadline is checked
        // once more before any pack data goes out
        callbacks.push_negotiation(move |_| {
            if Instant::now() < deadline {
                Ok(())
            } else {
                Err(git2::Error::from_str("network deadline passed before upload"))
            }
        });

        callbacks
    }

    fn failure(&self, context: String, err: git2::Error) -> Error {
        if Instant::now() >= self.deadline {
            warn!(timeout = ?self.timeout, "{}", context);
            return Error::RemoteAccess(format!(
                "{}: timed out after {:?}",
                context, self.timeout
            ));
        }

        Error::remote(context, err)
    }
}

/// Pick the credential kind to offer next, each at most once
///
/// Explicit user/password or token come first, then the SSH agent, then a
/// bare username. `None` means everything allowed has been rejected.
fn next_credential(
    allowed: CredentialType,
    offered: &mut CredentialType,
    has_plaintext: bool,
) -> Option<CredentialType> {
    let candidates = [
        (CredentialType::USER_PASS_PLAINTEXT, has_plaintext),
        (CredentialType::SSH_KEY, true),
        (CredentialType::USERNAME, true),
    ];

    let kind = candidates
        .into_iter()
        .find(|(kind, usable)| *usable && allowed.contains(*kind) && !offered.contains(*kind))
        .map(|(kind, _)| kind)?;
    offered.insert(kind);
    Some(kind)
}

/// Bound how long libgit2 waits to connect and on a silent socket
///
/// These are process-wide libgit2 settings. Only the first call has an
/// effect, and it must happen before other threads start using libgit2.
pub fn init_transport_timeouts(timeout: Duration) {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let millis = c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX);
        // SAFETY: guarded by `Once`, and callers run it before spawning
        // threads that touch libgit2
        #[allow(unsafe_code)]
        let result = unsafe {
            git2::opts::set_server_connect_timeout_in_milliseconds(millis)
                .and_then(|_| git2::opts::set_server_timeout_in_milliseconds(millis))
        };
        match result {
            Ok(()) => debug!(?timeout, "Configured libgit2 transport timeouts"),
            Err(e) => warn!(error = %e, "Cannot configure libgit2 transport timeouts"),
        }
    });
}

/// Strip userinfo from a URI before it reaches a log line or error message
pub fn redact(uri: &str) -> String {
    match url::Url::parse(uri) {
        Ok(mut url) if !url.username().is_empty() || url.password().is_some() => {
            // Only fails for URLs that cannot carry credentials at all
            let _ = url.set_password(None);
            let _ = url.set_username("");
            url.to_string()
        }
        _ => uri.to_string(),
    }
}
