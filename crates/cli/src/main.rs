//! Cairn CLI - cairn command

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod cmd;
mod progress;
mod util;

/// Cairn - deduplicating backups into a git-compatible object store
#[derive(Parser)]
#[command(name = "cairn")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Repository directory (default: $CAIRN_DIR, then ~/.cairn)
    #[arg(long, global = true, value_name = "DIR")]
    repo: Option<PathBuf>,

    /// Log more (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty repository
    Init,
    /// Save files and directories into the repository
    Save(cmd::save::SaveArgs),
    /// Serve a repository on stdin/stdout for remote saves
    Server {
        /// Repository to serve (default: the local repository)
        path: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    util::init_logging(cli.verbose);

    let repo_dir = util::resolve_repo_dir(cli.repo)?;

    match cli.command {
        Commands::Init => cmd::init::run(&repo_dir),
        Commands::Save(args) => cmd::save::run(&repo_dir, &args, cli.verbose),
        Commands::Server { path } => cmd::server::run(&path.unwrap_or(repo_dir)),
    }
}
