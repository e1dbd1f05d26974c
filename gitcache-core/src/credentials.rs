//! Per-call git credentials and the session store that hands them out
//!
//! The core never remembers credentials between calls. Servers that map
//! sessions to tokens keep a [`CredentialStore`] of their own and pass it
//! by reference wherever a lookup is needed.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use tracing::debug;

use crate::{Error, Result};

/// Credentials used to authenticate clone/fetch/push
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    /// No authentication (local paths, public remotes)
    #[default]
    Anonymous,
    /// Plain username and password
    UserPass {
        /// Username
        username: String,
        /// Password
        password: String,
    },
    /// OAuth or personal access token, sent as the username with an empty password
    Token(String),
}

impl Credentials {
    /// Build token credentials
    pub fn token(token: impl Into<String>) -> Self {
        Credentials::Token(token.into())
    }

    /// Build username/password credentials
    pub fn user_pass(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::UserPass {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Username/password pair to present over HTTPS, if any
    pub fn plaintext(&self) -> Option<(&str, &str)> {
        match self {
            Credentials::Anonymous => None,
            Credentials::UserPass { username, password } => {
                Some((username.as_str(), password.as_str()))
            }
            Credentials::Token(token) => Some((token.as_str(), "")),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Anonymous => f.write_str("Anonymous"),
            Credentials::UserPass { username, .. } => f
                .debug_struct("UserPass")
                .field("username", username)
                .finish_non_exhaustive(),
            Credentials::Token(_) => f.write_str("Token(..)"),
        }
    }
}

/// Session id to credentials map
#[derive(Debug, Default)]
pub struct CredentialStore {
    sessions: RwLock<HashMap<String, Credentials>>,
}

impl CredentialStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register credentials for a session, replacing any previous ones
    pub fn insert(&self, session_id: impl Into<String>, credentials: Credentials) {
        let session_id = session_id.into();
        debug!(session = %session_id, "Storing session credentials");
        self.write().insert(session_id, credentials);
    }

    /// Credentials for a session
    pub fn get(&self, session_id: &str) -> Result<Credentials> {
        self.read().get(session_id).cloned().ok_or_else(|| {
            Error::Unauthorized(format!(
                "No credentials for session '{}'. Authorize before making requests.",
                session_id
            ))
        })
    }

    /// Forget a session, returning its credentials if it had any
    pub fn remove(&self, session_id: &str) -> Option<Credentials> {
        self.write().remove(session_id)
    }

    /// Number of sessions with credentials
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no session has credentials
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Credentials>> {
        self.sessions.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Credentials>> {
        self.sessions.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
