//! Shared utilities for CLI commands

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::Level;

/// Environment variable naming the repository directory
pub const REPO_ENV: &str = "CAIRN_DIR";

/// Pick the repository directory: flag, then `$CAIRN_DIR`, then `~/.cairn`
pub fn resolve_repo_dir(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = flag {
        return Ok(dir);
    }
    if let Some(dir) = std::env::var_os(REPO_ENV).filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let home =
        dirs::home_dir().context("Cannot find a home directory; pass --repo or set CAIRN_DIR")?;
    Ok(home.join(".cairn"))
}

/// Log to stderr; stdout is reserved for ids and the server protocol
pub fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
