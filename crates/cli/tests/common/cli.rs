//! CLI command execution helpers
//!
//! Thin wrapper around the built `cairn` binary with convenient assertion
//! methods. Every command runs against an explicit repository through
//! `CAIRN_DIR` so tests never touch the real home directory.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

/// CLI command builder
pub struct CairnCommand {
    binary_path: PathBuf,
    working_dir: PathBuf,
    args: Vec<String>,
    env: HashMap<String, String>,
}

impl CairnCommand {
    /// Create a new command in the given working directory
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            binary_path: PathBuf::from(env!("CARGO_BIN_EXE_cairn")),
            working_dir: working_dir.as_ref().to_path_buf(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    /// Add command arguments
    pub fn args<S: AsRef<str>>(&mut self, args: &[S]) -> &mut Self {
        self.args.extend(args.iter().map(|s| s.as_ref().to_string()));
        self
    }

    /// Set environment variable
    pub fn env(&mut self, key: &str, value: impl AsRef<Path>) -> &mut Self {
        self.env
            .insert(key.to_string(), value.as_ref().display().to_string());
        self
    }

    pub fn execute(&self) -> Result<CommandResult> {
        let output = Command::new(&self.binary_path)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .env_remove("CAIRN_DIR")
            .envs(&self.env)
            .output()
            .context("Failed to execute command")?;

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// Execute and assert success
    pub fn assert_success(&self) -> Result<CommandResult> {
        let result = self.execute()?;
        if !result.success() {
            anyhow::bail!(
                "Command failed (exit code: {}):\nArgs: {:?}\nStdout: {}\nStderr: {}",
                result.exit_code,
                self.args,
                result.stdout,
                result.stderr
            );
        }
        Ok(result)
    }

    /// Execute and expect failure
    pub fn assert_failure(&self) -> Result<CommandResult> {
        let result = self.execute()?;
        if result.success() {
            anyhow::bail!(
                "Command should have failed but succeeded:\nArgs: {:?}\nStdout: {}",
                self.args,
                result.stdout
            );
        }
        Ok(result)
    }
}

/// Command execution result
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Object ids printed on stdout, one per line
    pub fn ids(&self) -> Vec<String> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|line| is_object_id(line))
            .map(str::to_string)
            .collect()
    }
}

pub fn is_object_id(text: &str) -> bool {
    text.len() == 40 && text.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// Build a command against `repo`, run from `dir`
///
/// Usage:
/// ```ignore
/// cairn!(dir, repo, "save", "-t", "data").assert_success()?;
/// ```
#[macro_export]
macro_rules! cairn {
    ($dir:expr, $repo:expr, $($arg:expr),*) => {{
        let mut cmd = $crate::common::cli::CairnCommand::new($dir);
        cmd.env("CAIRN_DIR", $repo);
        cmd.args(&[$($arg),*]);
        cmd
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_detection() {
        assert!(is_object_id("4b825dc642cb6eb9a060e54bf8d69288fbee4904"));
        assert!(!is_object_id("4B825DC642CB6EB9A060E54BF8D69288FBEE4904"));
        assert!(!is_object_id("WARNING: 1 errors encountered while saving."));
    }
}
