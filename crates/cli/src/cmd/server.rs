//! Serve a repository over stdin/stdout

use anyhow::{Context, Result};
use cairn_core::{remote, Repository};
use std::io;
use std::path::Path;

pub fn run(repo_dir: &Path) -> Result<()> {
    let mut repo = Repository::open(repo_dir)
        .with_context(|| format!("Failed to open repository {}", repo_dir.display()))?;
    tracing::info!(repo = %repo_dir.display(), "serving");

    let stdin = io::stdin().lock();
    let stdout = io::stdout().lock();
    remote::serve(&mut repo, stdin, io::BufWriter::new(stdout)).context("Remote session failed")?;
    Ok(())
}
