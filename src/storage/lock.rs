// src/storage/lock.rs

//! Advisory file locks shared between worker processes
//!
//! Two things are guarded this way:
//!
//! - **Log appends**: the blob file itself is locked while a chunk is written,
//!   so stages running in different workers keep their lines in order.
//! - **Environment symlinks**: `<target>.lock` next to the symlink is held
//!   while the link is replaced.
//!
//! Locks use `flock(LOCK_EX)` and are released when the guard drops.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive lock on a file, held until drop
pub struct PathLock {
    file: File,
    path: PathBuf,
}

impl PathLock {
    /// Acquire an exclusive lock on `path`, blocking until available
    ///
    /// The file is created if missing and never truncated, so the lock
    /// file may be the data file itself.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = Self::open(&path)?;
        file.lock_exclusive()
            .map_err(|e| Error::Storage(format!("Failed to lock {}: {e}", path.display())))?;
        debug!("Acquired lock on {}", path.display());
        Ok(Self { file, path })
    }

    /// Try to acquire without blocking; `Ok(None)` when another holder has it
    pub fn try_acquire<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();
        let file = Self::open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file, path })),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("Lock on {} already held", path.display());
                Ok(None)
            }
            Err(e) => Err(Error::Storage(format!(
                "Failed to try-lock {}: {e}",
                path.display()
            ))),
        }
    }

    /// Lock file guarding `target` (`<target>.lock`)
    pub fn sidecar(target: &Path) -> PathBuf {
        let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".lock");
        target.with_file_name(name)
    }

    fn open(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?)
    }

    /// The locked file, for writing while the lock is held
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
