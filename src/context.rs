// src/context.rs

//! Shared application state
//!
//! One [`AppContext`] is built per process from the configuration and
//! shared (behind an `Arc`) by HTTP handlers and worker tasks. Database
//! connections are opened per operation; blocking database work is moved
//! off the async runtime with [`AppContext::db`].

use crate::build::install::{CondaInstaller, Installer};
use crate::build::plugin::{CondaLockPlugin, LockPlugin};
use crate::config::{Config, StorageBackend};
use crate::db;
use crate::error::{Error, Result};
use crate::settings::{self, Settings};
use crate::storage::{ArtifactStore, BlobStore, LocalStorage, S3Storage, run_blocking};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub struct AppContext {
    pub config: Config,
    pub store: Arc<ArtifactStore>,
    pub lock_plugin: Arc<dyn LockPlugin>,
    pub installer: Arc<dyn Installer>,
    pub http: reqwest::Client,
}

impl AppContext {
    /// Build the context with the built-in solver and installer
    pub fn new(config: Config) -> Result<Self> {
        let backend: Arc<dyn BlobStore> = match config.storage.backend {
            StorageBackend::Local => Arc::new(LocalStorage::new(
                &config.storage.local_path,
                config.storage_url(),
            )),
            StorageBackend::S3 => {
                let s3 = config.storage.s3.as_ref().ok_or_else(|| {
                    Error::Config("storage.backend = \"s3\" requires [storage.s3]".into())
                })?;
                Arc::new(S3Storage::new(s3)?)
            }
        };
        let store = Arc::new(ArtifactStore::new(backend, &config.storage.database));

        let http = reqwest::Client::builder()
            .user_agent(concat!("envstore/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            lock_plugin: Arc::new(CondaLockPlugin::new(&config.worker.conda_lock_command)),
            installer: Arc::new(CondaInstaller),
            config,
            store,
            http,
        })
    }

    pub fn with_lock_plugin(mut self, plugin: Arc<dyn LockPlugin>) -> Self {
        self.lock_plugin = plugin;
        self
    }

    pub fn with_installer(mut self, installer: Arc<dyn Installer>) -> Self {
        self.installer = installer;
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.config.storage.database
    }

    pub fn open_db(&self) -> Result<Connection> {
        db::open(self.db_path())
    }

    /// Run `f` with a fresh connection on the blocking pool
    pub async fn db<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.db_path().to_path_buf();
        run_blocking(move || {
            let mut conn = db::open(&path)?;
            f(&mut conn)
        })
        .await
    }

    /// Deployment defaults from the `[settings]` table
    pub fn defaults(&self) -> &Settings {
        &self.config.settings
    }

    /// Effective settings for a scope
    pub async fn settings(&self, namespace: Option<String>, environment: Option<String>) -> Result<Settings> {
        let defaults = self.defaults().clone();
        self.db(move |conn| {
            settings::get_settings(conn, &defaults, namespace.as_deref(), environment.as_deref())
        })
        .await
    }

    pub fn store_directory(&self) -> &Path {
        &self.config.storage.store_directory
    }
}
