//! Common utilities for integration tests

pub mod cli;

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Scratch area with a repository path and a data directory
pub struct Workspace {
    pub dir: TempDir,
    pub repo: PathBuf,
    pub data: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let data = dir.path().join("data");
        fs::create_dir(&data).unwrap();
        Self { dir, repo, data }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.data.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    pub fn read_ref(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.repo.join("refs/heads").join(name))
            .ok()
            .map(|text| text.trim().to_string())
    }
}
