// src/storage/mod.rs

//! Blob store for build artifacts
//!
//! [`BlobStore`] is the backend seam (local filesystem or S3-compatible).
//! [`ArtifactStore`] binds blobs to builds: a blob is written first and its
//! `build_artifact` row second, and a failed row insert removes the blob
//! unless an existing row already references its key. No row ever points
//! at a missing blob and no blob is advertised without a row.

pub mod local;
pub mod lock;
pub mod s3;

pub use local::LocalStorage;
pub use lock::PathLock;
pub use s3::S3Storage;

use crate::db;
use crate::db::models::{ArtifactType, BuildArtifact};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Storage backend
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `bytes` under `key`, replacing any previous content
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()>;

    /// Same as `put`, streaming from a file on disk
    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// URL a client can be redirected to
    async fn get_url(&self, key: &str) -> Result<String>;

    /// Remove the blob; a missing blob is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Append to the blob, creating it if missing
    async fn append(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Directory served at `/storage` by the HTTP layer, if any
    fn local_root(&self) -> Option<&Path> {
        None
    }
}

/// Reject keys that are absolute or climb out of the store
pub(crate) fn validate_key(key: &str) -> Result<&Path> {
    let path = Path::new(key);
    let ok = !key.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(path)
    } else {
        Err(Error::Validation(format!("invalid blob key {key}")))
    }
}

/// Blob store bound to the build index
pub struct ArtifactStore {
    backend: Arc<dyn BlobStore>,
    db_path: PathBuf,
    log_locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl ArtifactStore {
    pub fn new(backend: Arc<dyn BlobStore>, db_path: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            db_path: db_path.into(),
            log_locks: DashMap::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn BlobStore> {
        &self.backend
    }

    /// Store `bytes` and record the artifact; idempotent per (build, type, key)
    pub async fn put(
        &self,
        build_id: i64,
        key: &str,
        bytes: &[u8],
        content_type: &str,
        artifact_type: ArtifactType,
    ) -> Result<()> {
        let referenced = self.key_referenced(key).await?;
        self.backend.put(key, bytes, content_type).await?;
        self.record_or_rollback(build_id, key, artifact_type, referenced).await
    }

    pub async fn put_file(
        &self,
        build_id: i64,
        key: &str,
        path: &Path,
        content_type: &str,
        artifact_type: ArtifactType,
    ) -> Result<()> {
        let referenced = self.key_referenced(key).await?;
        self.backend.put_file(key, path, content_type).await?;
        self.record_or_rollback(build_id, key, artifact_type, referenced).await
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.backend.get(key).await
    }

    pub async fn get_url(&self, key: &str) -> Result<String> {
        self.backend.get_url(key).await
    }

    /// Remove the artifact row, then the blob
    pub async fn delete(&self, build_id: i64, key: &str) -> Result<()> {
        let db_path = self.db_path.clone();
        let owned_key = key.to_string();
        run_blocking(move || {
            let conn = db::open(&db_path)?;
            BuildArtifact::delete(&conn, build_id, &owned_key)
        })
        .await?;
        self.backend.delete(key).await
    }

    /// Append to the build log, serialized per build
    ///
    /// The LOGS row is recorded on every append (a no-op after the first).
    pub async fn append_logs(&self, build_id: i64, key: &str, text: &str) -> Result<()> {
        let lock = self
            .log_locks
            .entry(build_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        self.backend.append(key, text.as_bytes()).await?;
        self.record(build_id, key, ArtifactType::Logs).await
    }

    /// Drop the per-build log lock once a build has finished
    pub fn release_logs(&self, build_id: i64) {
        self.log_locks.remove(&build_id);
    }

    /// `referenced` keys belong to existing rows and are never removed here
    async fn record_or_rollback(
        &self,
        build_id: i64,
        key: &str,
        artifact_type: ArtifactType,
        referenced: bool,
    ) -> Result<()> {
        if let Err(e) = self.record(build_id, key, artifact_type).await {
            warn!("Failed to record artifact {} for build {}: {}", key, build_id, e);
            if referenced {
                return Err(e);
            }
            if let Err(cleanup) = self.backend.delete(key).await {
                warn!("Failed to remove unrecorded blob {}: {}", key, cleanup);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn key_referenced(&self, key: &str) -> Result<bool> {
        let db_path = self.db_path.clone();
        let key = key.to_string();
        run_blocking(move || {
            let conn = db::open(&db_path)?;
            BuildArtifact::key_exists(&conn, &key)
        })
        .await
    }

    async fn record(&self, build_id: i64, key: &str, artifact_type: ArtifactType) -> Result<()> {
        let db_path = self.db_path.clone();
        let key = key.to_string();
        run_blocking(move || {
            let conn = db::open(&db_path)?;
            let mut artifact = BuildArtifact::new(build_id, artifact_type, key);
            if artifact.insert_or_ignore(&conn)? {
                debug!("Recorded {} artifact {} for build {}", artifact_type, artifact.key, build_id);
            }
            Ok(())
        })
        .await
    }
}

/// Free and total bytes of the filesystem holding `path`
pub fn disk_space(path: &Path) -> Result<(u64, u64)> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(std::io::Error::from)?;
    let fragment = stat.fragment_size() as u64;
    Ok((
        stat.blocks_available() as u64 * fragment,
        stat.blocks() as u64 * fragment,
    ))
}

/// Run blocking work (database, filesystem) off the async runtime
pub async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(format!("Task join error: {e}"))))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Build, Environment, Namespace, Specification};
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathBuf, i64) {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("envstore.db");
        db::init(&db_path).unwrap();
        let conn = db::open(&db_path).unwrap();
        let ns = Namespace::ensure(&conn, "default").unwrap();
        let env = Environment::ensure(&conn, &ns, "test", None).unwrap();
        let spec = Specification::new("test".into(), serde_json::json!({}), "x".into(), false)
            .insert_or_get(&conn)
            .unwrap();
        let build_id = Build::new(spec.id.unwrap(), env.id.unwrap(), 2)
            .insert(&conn)
            .unwrap();
        (temp, db_path, build_id)
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("logs/abc.log").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("").is_err());
    }

    #[tokio::test]
    async fn test_put_records_artifact_once() {
        let (temp, db_path, build_id) = setup();
        let backend = Arc::new(LocalStorage::new(temp.path().join("blobs"), "http://localhost/storage"));
        let store = ArtifactStore::new(backend, &db_path);

        store
            .put(build_id, "yaml/k.yml", b"name: test\n", "text/yaml", ArtifactType::Yaml)
            .await
            .unwrap();
        store
            .put(build_id, "yaml/k.yml", b"name: test\n", "text/yaml", ArtifactType::Yaml)
            .await
            .unwrap();

        let conn = db::open(&db_path).unwrap();
        let artifacts = BuildArtifact::find_by_build(&conn, build_id).unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(store.get("yaml/k.yml").await.unwrap(), b"name: test\n");
    }

    #[tokio::test]
    async fn test_failed_record_removes_blob() {
        let (temp, db_path, _) = setup();
        let backend = Arc::new(LocalStorage::new(temp.path().join("blobs"), "http://localhost/storage"));
        let store = ArtifactStore::new(backend, &db_path);

        // no such build: the foreign key rejects the row
        let result = store
            .put(9999, "yaml/orphan.yml", b"x", "text/yaml", ArtifactType::Yaml)
            .await;
        assert!(result.is_err());
        assert!(!temp.path().join("blobs/yaml/orphan.yml").exists());
    }

    #[tokio::test]
    async fn test_failed_record_keeps_blob_of_existing_artifact() {
        let (temp, db_path, build_id) = setup();
        let backend = Arc::new(LocalStorage::new(temp.path().join("blobs"), "http://localhost/storage"));
        let store = ArtifactStore::new(backend, &db_path);

        store
            .put(build_id, "yaml/shared.yml", b"name: test\n", "text/yaml", ArtifactType::Yaml)
            .await
            .unwrap();

        // rewriting the key for a missing build fails to record
        let result = store
            .put(9999, "yaml/shared.yml", b"name: test\n", "text/yaml", ArtifactType::Yaml)
            .await;
        assert!(result.is_err());
        assert_eq!(store.get("yaml/shared.yml").await.unwrap(), b"name: test\n");

        let conn = db::open(&db_path).unwrap();
        assert!(BuildArtifact::find(&conn, build_id, ArtifactType::Yaml).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_log_appends_keep_whole_lines() {
        let (temp, db_path, build_id) = setup();
        let backend = Arc::new(LocalStorage::new(temp.path().join("blobs"), "http://localhost/storage"));
        let store = Arc::new(ArtifactStore::new(backend, &db_path));

        let mut handles = Vec::new();
        for stage in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for line in 0..10 {
                    store
                        .append_logs(build_id, "logs/k.log", &format!("stage{stage} line{line}\n"))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let text = String::from_utf8(store.get("logs/k.log").await.unwrap()).unwrap();
        assert_eq!(text.lines().count(), 40);
        for stage in 0..4 {
            let lines: Vec<&str> = text.lines().filter(|l| l.starts_with(&format!("stage{stage} "))).collect();
            let expected: Vec<String> = (0..10).map(|i| format!("stage{stage} line{i}")).collect();
            assert_eq!(lines, expected);
        }

        let conn = db::open(&db_path).unwrap();
        assert!(BuildArtifact::find(&conn, build_id, ArtifactType::Logs).unwrap().is_some());
    }
}
