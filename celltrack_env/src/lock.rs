//! Directory and scan-window locks.
//!
//! Two instances of the tracker must never mutate the same output directory:
//! the `DirLock` file is created (not merely opened) at startup and failure
//! to create it is fatal, with no retry. The `ScanWindowLock` brackets one
//! scan's store mutations so that external status tools see either the
//! fully-prior or the fully-current state.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::EnvError;

const DIR_LOCK_NAME: &str = ".celltrack.lock";
const SCAN_LOCK_NAME: &str = "header.lock";

/// Exclusive ownership of an output directory for the process lifetime.
///
/// Released (file removed) on drop.
pub struct DirLock {
    path: PathBuf,
}

impl DirLock {
    /// Creates the lock file exclusively.
    ///
    /// Returns `EnvError::LockHeld` if the file already exists, which means
    /// another tracker instance owns the directory (or died without
    /// cleanup, in which case the operator removes the file by hand).
    pub fn acquire(dir: &Path) -> Result<Self, EnvError> {
        let path = dir.join(DIR_LOCK_NAME);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    EnvError::LockHeld(path.display().to_string())
                }
                _ => EnvError::Io(e),
            })?;
        // Record the owner pid for the operator.
        let _ = writeln!(file, "{}", std::process::id());
        Ok(Self { path })
    }

    /// The lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("cannot remove lock file {}: {}", self.path.display(), e);
        }
    }
}

/// Advisory lock over one scan's store mutation window.
///
/// External readers are expected to skip reading while the file exists.
pub struct ScanWindowLock {
    path: PathBuf,
}

impl ScanWindowLock {
    /// Marks the start of a mutation window.
    pub fn acquire(dir: &Path) -> Result<Self, EnvError> {
        let path = dir.join(SCAN_LOCK_NAME);
        OpenOptions::new().write(true).create(true).truncate(true).open(&path)?;
        Ok(Self { path })
    }
}

impl Drop for ScanWindowLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("cannot remove scan lock {}: {}", self.path.display(), e);
        }
    }
}
