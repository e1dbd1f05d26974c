//! Read command - print a file from a branch

use std::io::Write;

use clap::Args;
use gitcache_core::{Config, FileOperations};

use super::CredentialArgs;

/// Print a file from a branch to stdout
#[derive(Args, Debug)]
pub struct ReadArgs {
    /// Repository URI
    pub uri: String,

    /// Branch to read from
    pub branch: String,

    /// Path of the file inside the repository
    pub path: String,
}

impl ReadArgs {
    /// Execute the read command
    pub async fn execute(&self, config: &Config, credentials: &CredentialArgs) -> anyhow::Result<()> {
        let credentials = credentials.resolve()?;
        let ops = FileOperations::new(config)?;

        let bytes = ops
            .read_file(&self.uri, &self.branch, &self.path, &credentials)
            .await?;

        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&bytes)?;
        stdout.flush()?;
        Ok(())
    }
}
