//! List command - show the entries of a directory on a branch

use clap::Args;
use gitcache_core::{Config, FileOperations};

use super::CredentialArgs;

/// List a directory on a branch
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Repository URI
    pub uri: String,

    /// Branch to list
    pub branch: String,

    /// Directory inside the repository (defaults to the root)
    #[arg(default_value = "")]
    pub path: String,

    /// Print entries as JSON
    #[arg(long)]
    pub json: bool,
}

impl ListArgs {
    /// Execute the list command
    pub async fn execute(&self, config: &Config, credentials: &CredentialArgs) -> anyhow::Result<()> {
        let credentials = credentials.resolve()?;
        let ops = FileOperations::new(config)?;

        let entries = ops
            .list_files(&self.uri, &self.branch, &self.path, &credentials)
            .await?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&entries)?);
            return Ok(());
        }

        for entry in &entries {
            println!("{}", entry);
        }
        Ok(())
    }
}
