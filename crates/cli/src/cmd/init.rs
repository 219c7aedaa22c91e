//! Initialize a cairn repository

use anyhow::{Context, Result};
use cairn_core::Repository;
use owo_colors::OwoColorize;
use std::path::Path;

pub fn run(repo_dir: &Path) -> Result<()> {
    Repository::init(repo_dir)
        .with_context(|| format!("Failed to initialize repository at {}", repo_dir.display()))?;

    println!(
        "{} empty cairn repository in {}",
        "Initialized".green(),
        repo_dir.display()
    );
    println!();
    println!("Created:");
    println!("  - objects/       (content-addressed objects)");
    println!("  - refs/heads/    (one ref per backup set)");
    println!("  - config.toml    (chunking and store settings)");
    Ok(())
}
