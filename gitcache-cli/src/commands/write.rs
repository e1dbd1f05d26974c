//! Write command - commit a file to a branch and push it

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use gitcache_core::{Config, FileOperations};

use super::CredentialArgs;

/// Commit a file to a branch and push it
#[derive(Args, Debug)]
pub struct WriteArgs {
    /// Repository URI
    pub uri: String,

    /// Branch to commit on (created from the current HEAD if missing)
    pub branch: String,

    /// Path of the file inside the repository
    pub path: String,

    /// Local file whose contents are committed
    #[arg(long, conflicts_with = "content", required_unless_present = "content")]
    pub file: Option<PathBuf>,

    /// Literal contents to commit
    #[arg(long)]
    pub content: Option<String>,

    /// Commit message
    #[arg(short, long)]
    pub message: String,

    /// Name recorded as author and committer
    #[arg(long)]
    pub committer: String,
}

impl WriteArgs {
    /// Execute the write command
    pub async fn execute(
        &self,
        config: &Config,
        credentials: &CredentialArgs,
        verbose: bool,
    ) -> anyhow::Result<()> {
        let content = match (&self.file, &self.content) {
            (Some(file), _) => std::fs::read(file)
                .with_context(|| format!("Failed to read {}", file.display()))?,
            (None, Some(content)) => content.clone().into_bytes(),
            (None, None) => anyhow::bail!("Either --file or --content is required"),
        };

        let credentials = credentials.resolve()?;
        let ops = FileOperations::new(config)?;

        ops.write_file(
            &self.uri,
            &self.branch,
            &self.path,
            &content,
            &self.message,
            &self.committer,
            &credentials,
        )
        .await?;

        if verbose {
            println!(
                "Committed {} ({} bytes) to {}",
                self.path,
                content.len(),
                self.branch
            );
        }
        Ok(())
    }
}
