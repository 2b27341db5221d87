//! Crash-safe replacement of small state files.
//!
//! 1. Write to a temporary file in the same directory
//! 2. `sync_all()` the temporary file
//! 3. Rename it over the target
//! 4. Fsync the parent directory (Unix only)
//!
//! After a crash the file holds either the old or the new content.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::CommitError;

/// Error type for atomic I/O operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AtomicIoError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Path has no parent directory: {0}")]
    NoParentDir(PathBuf),
}

impl From<AtomicIoError> for CommitError {
    fn from(e: AtomicIoError) -> Self {
        CommitError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AtomicIoError>;

fn temp_path(path: &Path) -> Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| AtomicIoError::NoParentDir(path.to_path_buf()))?;
    let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("state");
    Ok(parent.join(format!(".{}.tmp.{}", file_name, Uuid::new_v4())))
}

#[cfg(unix)]
fn fsync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(not(unix))]
fn fsync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Atomically replace the content of `path` with `data`.
pub fn atomic_write(path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let parent = path
        .parent()
        .ok_or_else(|| AtomicIoError::NoParentDir(path.to_path_buf()))?;
    fs::create_dir_all(parent)?;

    let temp = temp_path(path)?;
    let written = (|| -> io::Result<()> {
        let mut file = File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&temp);
        return Err(e.into());
    }

    fs::rename(&temp, path)?;
    fsync_dir(parent)?;
    Ok(())
}

/// Read `path`, treating a missing file as no content.
pub fn read_if_exists(path: impl AsRef<Path>) -> Result<Option<Vec<u8>>> {
    match fs::read(path.as_ref()) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
