//! gitcache CLI - read, write and list files in remote git repositories
//!
//! Every command works through the local clone cache, so repeated calls
//! against the same repository only transfer what changed.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use gitcache_core::git::init_transport_timeouts;
use gitcache_core::{Config, Secrets};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::{CredentialArgs, ListArgs, ReadArgs, WriteArgs};

/// gitcache: serve files from remote git repositories through a local cache
#[derive(Parser, Debug)]
#[command(name = "gitcache")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding cached clones (overrides config and env)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(flatten)]
    credentials: CredentialArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a file from a branch to stdout
    #[command(visible_alias = "r")]
    Read(ReadArgs),

    /// Commit a file to a branch and push it
    #[command(visible_alias = "w")]
    Write(WriteArgs),

    /// List a directory on a branch
    #[command(visible_alias = "ls")]
    List(ListArgs),

    /// Show current configuration
    Config,

    /// Show version information
    Version,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    // Load configuration with overrides
    let config = Config::load_with_overrides(cli.cache_dir.clone())?;

    if cli.verbose {
        tracing::info!(
            cache_root = ?config.cache.root,
            remote = %config.git.remote,
            "Configuration loaded"
        );
    }

    // libgit2 socket timeouts are process-wide and must be set before the
    // runtime starts its worker threads
    init_transport_timeouts(config.git.network_timeout);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli, config))
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    match cli.command {
        Some(Commands::Read(args)) => {
            args.execute(&config, &cli.credentials).await?;
        }
        Some(Commands::Write(args)) => {
            args.execute(&config, &cli.credentials, cli.verbose).await?;
        }
        Some(Commands::List(args)) => {
            args.execute(&config, &cli.credentials).await?;
        }
        Some(Commands::Config) => print_config(&config)?,
        Some(Commands::Version) => {
            println!("gitcache {}", env!("CARGO_PKG_VERSION"));
        }
        None => {
            println!("gitcache - local cache for remote git repositories");
            println!();
            println!("Use --help for usage information");
        }
    }

    Ok(())
}

fn print_config(config: &Config) -> anyhow::Result<()> {
    println!("gitcache Configuration");
    println!("======================");
    println!();
    println!("Cache Settings:");
    println!("  root: {}", config.cache_root()?.display());
    println!();
    println!("Git Settings:");
    println!("  remote: {}", config.git.remote);
    println!("  network_timeout: {:?}", config.git.network_timeout);
    println!("  operation_timeout: {:?}", config.git.operation_timeout);
    println!();

    if let Some(path) = Config::default_config_path() {
        println!("Config file: {}", path.display());
        if path.exists() {
            println!("  (exists)");
        } else {
            println!("  (not found - using defaults)");
        }
    }

    if let Some(path) = Secrets::default_secrets_path() {
        println!("Secrets file: {}", path.display());
        if path.exists() {
            println!("  (exists)");
        } else {
            println!("  (not found - anonymous access unless GITCACHE_TOKEN is set)");
        }
    }

    Ok(())
}
