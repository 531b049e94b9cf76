// src/storage/local.rs

//! Local filesystem blob backend
//!
//! Blobs live under `storage_path/<key>`. Writes go to a temp file in the
//! destination directory and are renamed into place, so readers never see
//! a partial blob. The HTTP layer serves `storage_path` at `/storage`.

use super::lock::PathLock;
use super::{BlobStore, run_blocking, validate_key};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub struct LocalStorage {
    storage_path: PathBuf,
    /// Public base URL under which `storage_path` is served
    storage_url: String,
}

impl LocalStorage {
    pub fn new(storage_path: impl Into<PathBuf>, storage_url: impl Into<String>) -> Self {
        Self {
            storage_path: storage_path.into(),
            storage_url: storage_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Ok(self.storage_path.join(validate_key(key)?))
    }
}

/// Write via a sibling temp file and rename into place
fn write_atomic(dest: &Path, write: impl FnOnce(&mut NamedTempFile) -> std::io::Result<()>) -> Result<()> {
    let dir = dest
        .parent()
        .ok_or_else(|| Error::Storage(format!("blob path {} has no parent", dest.display())))?;
    std::fs::create_dir_all(dir)?;
    let mut temp = NamedTempFile::new_in(dir)?;
    write(&mut temp)?;
    temp.as_file().sync_all()?;
    temp.persist(dest).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl BlobStore for LocalStorage {
    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<()> {
        let dest = self.resolve(key)?;
        let bytes = bytes.to_vec();
        run_blocking(move || write_atomic(&dest, |f| f.write_all(&bytes))).await
    }

    async fn put_file(&self, key: &str, path: &Path, _content_type: &str) -> Result<()> {
        let dest = self.resolve(key)?;
        let source = path.to_path_buf();
        run_blocking(move || {
            write_atomic(&dest, |f| {
                let mut input = std::fs::File::open(&source)?;
                std::io::copy(&mut input, f)?;
                Ok(())
            })
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("blob {key}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_url(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        Ok(format!("{}/{}", self.storage_url, key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn append(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        let bytes = bytes.to_vec();
        run_blocking(move || {
            // The log file is its own lock so other processes interleave whole chunks
            let lock = PathLock::acquire(&path)?;
            let mut file = lock.file();
            file.write_all(&bytes)?;
            file.flush()?;
            Ok(())
        })
        .await
    }

    fn local_root(&self) -> Option<&Path> {
        Some(&self.storage_path)
    }
}
