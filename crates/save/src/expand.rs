//! Recursive expansion of input paths into a flat stream of leaves

use crate::errors::{ErrorLog, SoftError};
use std::fs::{FileType, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Node type of an expanded path, as seen without following symlinks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Symlink,
    Directory,
    /// Sockets, fifos, devices
    Special,
}

impl FileKind {
    pub fn from_file_type(file_type: FileType) -> Self {
        if file_type.is_symlink() {
            FileKind::Symlink
        } else if file_type.is_file() {
            FileKind::Regular
        } else if file_type.is_dir() {
            FileKind::Directory
        } else {
            FileKind::Special
        }
    }
}

/// Status of one expanded path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStatus {
    pub kind: FileKind,
    pub size: u64,
    /// Raw permission and type bits (0 where the platform has none)
    pub mode: u32,
}

impl FileStatus {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            kind: FileKind::from_file_type(metadata.file_type()),
            size: metadata.len(),
            mode: raw_mode(metadata),
        }
    }

    /// Stat `path` without following a final symlink
    pub fn stat(path: &Path) -> io::Result<Self> {
        std::fs::symlink_metadata(path).map(|m| Self::from_metadata(&m))
    }
}

#[cfg(unix)]
fn raw_mode(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    metadata.mode()
}

#[cfg(not(unix))]
fn raw_mode(_metadata: &Metadata) -> u32 {
    0
}

/// Traversal failure that ends the save
#[derive(Error, Debug)]
#[error("failed to scan {}: {source}", path.display())]
pub struct ExpandError {
    pub path: PathBuf,
    #[source]
    pub source: walkdir::Error,
}

/// Lazy depth-first expansion of a list of roots
///
/// Directories are descended in the order the OS lists them and are never
/// yielded themselves. Symlinks are yielded as leaves, never followed, even
/// when given as a root. Paths that vanish or cannot be read are recorded in
/// the [`ErrorLog`] and skipped together with everything beneath them.
pub struct PathExpander<'a> {
    roots: std::vec::IntoIter<PathBuf>,
    current: Option<walkdir::IntoIter>,
    errors: &'a ErrorLog,
}

impl<'a> PathExpander<'a> {
    pub fn new<P: AsRef<Path>>(roots: &[P], errors: &'a ErrorLog) -> Self {
        let roots: Vec<PathBuf> = roots.iter().map(|p| p.as_ref().to_path_buf()).collect();
        Self {
            roots: roots.into_iter(),
            current: None,
            errors,
        }
    }

    fn walk(root: PathBuf) -> walkdir::IntoIter {
        WalkDir::new(root)
            .follow_links(false)
            .follow_root_links(false)
            .into_iter()
    }

    /// Decide whether a walk error is recorded and skipped or ends the run
    fn handle_error(&self, err: walkdir::Error) -> Result<(), ExpandError> {
        let path = err.path().map(Path::to_path_buf).unwrap_or_default();
        let soft = err.io_error().and_then(|io| match io.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                Some(SoftError::from_io(&path, io))
            }
            _ => None,
        });
        match soft {
            Some(soft) => {
                self.errors.record(soft);
                Ok(())
            }
            None => Err(ExpandError { path, source: err }),
        }
    }
}

impl Iterator for PathExpander<'_> {
    type Item = Result<(PathBuf, FileStatus), ExpandError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                let root = self.roots.next()?;
                tracing::debug!(root = %root.display(), "expanding");
                self.current = Some(Self::walk(root));
            }
            let walker = self.current.as_mut()?;

            let entry = match walker.next() {
                Some(Ok(entry)) => entry,
                Some(Err(err)) => match self.handle_error(err) {
                    Ok(()) => continue,
                    Err(fatal) => {
                        self.current = None;
                        return Some(Err(fatal));
                    }
                },
                None => {
                    self.current = None;
                    continue;
                }
            };

            if entry.file_type().is_dir() {
                continue;
            }
            let status = match entry.metadata() {
                Ok(metadata) => FileStatus::from_metadata(&metadata),
                Err(err) => match self.handle_error(err) {
                    Ok(()) => continue,
                    Err(fatal) => return Some(Err(fatal)),
                },
            };
            return Some(Ok((entry.into_path(), status)));
        }
    }
}
