//! CLI command implementations

pub mod list;
pub mod read;
pub mod write;

pub use list::ListArgs;
pub use read::ReadArgs;
pub use write::WriteArgs;

use clap::Args;
use gitcache_core::{Credentials, Secrets};

/// Credential overrides shared by every command
#[derive(Args, Debug, Default)]
pub struct CredentialArgs {
    /// Access token (overrides secrets file and GITCACHE_TOKEN)
    #[arg(long, global = true)]
    pub token: Option<String>,

    /// Username sent with the token
    #[arg(long, global = true)]
    pub username: Option<String>,
}

impl CredentialArgs {
    /// Resolve credentials: flags, then environment, then secrets file
    pub fn resolve(&self) -> anyhow::Result<Credentials> {
        if let Some(token) = &self.token {
            return Ok(gitcache_core::secrets::credentials_from(
                self.username.clone(),
                Some(token.clone()),
            ));
        }

        let credentials = Secrets::load()?.credentials();
        Ok(match (&self.username, credentials) {
            (Some(username), Credentials::Token(token))
            | (Some(username), Credentials::UserPass { password: token, .. }) => {
                Credentials::user_pass(username.clone(), token)
            }
            (_, credentials) => credentials,
        })
    }
}
