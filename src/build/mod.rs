// src/build/mod.rs

//! Build orchestration
//!
//! A build turns a specification into an installed prefix plus derived
//! artifacts. [`state`] owns the lifecycle, [`pipeline`] runs the stages,
//! [`plugin`] and [`install`] are the seams to the external solver and
//! installer, and [`artifacts`] produces the exports fanned out after a
//! build completes.

pub mod artifacts;
pub mod install;
pub mod key;
pub mod lockfile;
pub mod pipeline;
pub mod plugin;
pub mod process;
pub mod state;

use crate::db::models::{Build, Environment, Specification};
use crate::environment::spec::Submission;
use crate::error::{Error, Result};
use crate::storage::ArtifactStore;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// A build together with the rows its layout is derived from
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub build: Build,
    pub environment: Environment,
    pub specification: Specification,
}

impl BuildInfo {
    pub fn load(conn: &Connection, build_id: i64) -> Result<Self> {
        let build = Build::get(conn, build_id)?;
        let environment = Environment::find_by_id(conn, build.environment_id)?
            .ok_or_else(|| Error::NotFound(format!("environment {}", build.environment_id)))?;
        let specification = Specification::get(conn, build.specification_id)?;
        Ok(Self {
            build,
            environment,
            specification,
        })
    }

    pub fn id(&self) -> i64 {
        // loaded rows always carry their id
        self.build.id.unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        &self.environment.namespace
    }

    pub fn build_key(&self) -> Result<String> {
        key::build_key(
            self.build.build_key_version,
            self.id(),
            &self.specification.sha256,
            self.build.scheduled_at,
            &self.specification.name,
        )
    }

    pub fn build_path(&self, store_directory: &Path) -> Result<PathBuf> {
        Ok(key::build_path(
            store_directory,
            self.namespace(),
            &self.build_key()?,
            self.build.build_key_version,
        ))
    }

    pub fn environment_path(&self, store_directory: &Path) -> PathBuf {
        key::environment_path(store_directory, self.namespace(), &self.environment.name)
    }

    pub fn submission(&self) -> Result<Submission> {
        Submission::from_value(self.specification.spec.clone())
    }
}

/// Sink for the user-visible build log
///
/// Cloned into every stage; appends for one build are serialized by the
/// artifact store. A discarding sink is used where no build exists (solves).
#[derive(Clone)]
pub struct BuildLog {
    target: Option<Arc<LogTarget>>,
}

struct LogTarget {
    store: Arc<ArtifactStore>,
    build_id: i64,
    key: String,
}

impl BuildLog {
    pub fn new(store: Arc<ArtifactStore>, build_id: i64, key: impl Into<String>) -> Self {
        Self {
            target: Some(Arc::new(LogTarget {
                store,
                build_id,
                key: key.into(),
            })),
        }
    }

    pub fn discard() -> Self {
        Self { target: None }
    }

    /// Append `text`, adding a trailing newline when missing
    pub async fn append(&self, text: &str) -> Result<()> {
        let Some(target) = &self.target else {
            debug!("{}", text.trim_end());
            return Ok(());
        };
        if text.ends_with('\n') {
            target.store.append_logs(target.build_id, &target.key, text).await
        } else {
            target
                .store
                .append_logs(target.build_id, &target.key, &format!("{text}\n"))
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::db::models::Namespace;
    use serde_json::json;

    #[test]
    fn test_build_info_layout() {
        let conn = db::open_in_memory().unwrap();
        let ns = Namespace::ensure(&conn, "default").unwrap();
        let env = Environment::ensure(&conn, &ns, "test", None).unwrap();
        let spec = Specification::new(
            "test".into(),
            json!({"name": "test", "channels": ["main"], "dependencies": ["zlib"]}),
            "ab".repeat(32),
            false,
        )
        .insert_or_get(&conn)
        .unwrap();
        let build_id = Build::new(spec.id.unwrap(), env.id.unwrap(), 2).insert(&conn).unwrap();

        let info = BuildInfo::load(&conn, build_id).unwrap();
        let key = info.build_key().unwrap();
        assert!(key.starts_with("abababab-"));
        assert!(key.ends_with(&format!("-{build_id}-test")));
        assert_eq!(
            info.build_path(Path::new("/store")).unwrap(),
            PathBuf::from(format!("/store/default/{key}"))
        );
        assert_eq!(
            info.environment_path(Path::new("/store")),
            PathBuf::from("/store/default/envs/test")
        );
        assert_eq!(info.submission().unwrap().name(), "test");
    }
}
