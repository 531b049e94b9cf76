// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.
//!
//! Every store lives in its own temporary directory and uses a solver and
//! installer that never leave the machine: the solver returns a lockfile
//! pinning one package served from a `file://` channel, the installer writes
//! the matching `conda-meta` record into the prefix.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use envstore::auth::{Authenticator, Claims, TokenSigner};
use envstore::build::install::{InstallContext, Installer};
use envstore::build::lockfile::{LockMetadata, LockedPackage, Lockfile, PackageHash};
use envstore::build::plugin::{LockContext, LockPlugin};
use envstore::db::models::{ArtifactType, Build, BuildStatus};
use envstore::environment::spec::CondaSpecification;
use envstore::environment::{Registration, Submission, register};
use envstore::queue::WorkerPool;
use envstore::server::{AppState, create_router};
use envstore::settings::current_platform;
use envstore::{AppContext, Config, Error, Result, db};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

pub const PACKAGE_FILE: &str = "zlib-1.2.13-h0_0.conda";
const PACKAGE_BYTES: &[u8] = b"not really a conda archive";

/// Configuration rooted in `root` with a local blob backend
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.storage.database = root.join("envstore.db");
    config.storage.store_directory = root.join("store");
    config.storage.local_path = root.join("blobs");
    config.storage.package_cache = root.join("pkgs");
    config.auth.key_path = root.join("token.key");
    config.server.public_url = "http://envstore.test".to_string();
    config.settings.storage_threshold = 0;
    config.settings.build_artifacts = vec![ArtifactType::Lockfile, ArtifactType::Yaml, ArtifactType::CondaPack];
    config
}

/// A `file://` channel holding a single package for the host platform
pub fn create_channel(root: &Path) -> PathBuf {
    let channel = root.join("channel");
    let subdir = channel.join(current_platform());
    fs::create_dir_all(&subdir).unwrap();
    fs::write(subdir.join(PACKAGE_FILE), PACKAGE_BYTES).unwrap();
    channel
}

/// Lockfile pinning the package of [`create_channel`]
pub fn channel_lockfile(channel: &Path) -> Lockfile {
    let platform = current_platform().to_string();
    let url = url::Url::from_file_path(channel.join(&platform).join(PACKAGE_FILE)).unwrap();
    Lockfile {
        version: 1,
        metadata: LockMetadata {
            platforms: vec![platform.clone()],
            ..LockMetadata::default()
        },
        package: vec![LockedPackage {
            name: "zlib".to_string(),
            version: "1.2.13".to_string(),
            manager: "conda".to_string(),
            platform,
            dependencies: BTreeMap::new(),
            url: url.to_string(),
            hash: PackageHash {
                md5: None,
                sha256: Some(envstore::hash::sha256(PACKAGE_BYTES)),
            },
            category: "main".to_string(),
            optional: false,
        }],
    }
    .normalized()
}

/// What the fake solver does besides returning its lockfile
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SolverBehavior {
    Succeed,
    Fail,
    /// Request cancellation of every BUILDING build, then return at once
    CancelAndReturn,
    /// Request cancellation, then wait until the worker stops the task
    CancelAndWait,
}

pub struct FakeSolver {
    lockfile: Lockfile,
    behavior: SolverBehavior,
    database: PathBuf,
    pub calls: AtomicUsize,
}

impl FakeSolver {
    fn request_cancel_all(&self) -> Result<()> {
        let mut conn = db::open(&self.database)?;
        for build in Build::find_by_status(&conn, BuildStatus::Building)? {
            if let Some(id) = build.id {
                envstore::build::state::request_cancel(&mut conn, id)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LockPlugin for FakeSolver {
    fn name(&self) -> &str {
        "fake-solver"
    }

    async fn lock(&self, _spec: &CondaSpecification, _platforms: &[String], ctx: &LockContext) -> Result<Lockfile> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            SolverBehavior::Succeed => Ok(self.lockfile.clone()),
            SolverBehavior::Fail => Err(Error::BuildFailure("fake solver could not resolve".into())),
            SolverBehavior::CancelAndReturn => {
                self.request_cancel_all()?;
                Ok(self.lockfile.clone())
            }
            SolverBehavior::CancelAndWait => {
                self.request_cancel_all()?;
                match tokio::time::timeout(Duration::from_secs(30), ctx.cancel.cancelled()).await {
                    Ok(()) => Err(Error::Cancelled),
                    Err(_) => Err(Error::BuildFailure("never cancelled".into())),
                }
            }
        }
    }
}

/// What the fake installer leaves in the prefix
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InstallerBehavior {
    Succeed,
    /// A `conda-meta` entry that cannot be read, so recording packages
    /// fails after the prefix is fully written
    UnreadableRecord,
}

/// Writes one `conda-meta` record per locked conda package
pub struct FakeInstaller {
    behavior: InstallerBehavior,
}

#[async_trait]
impl Installer for FakeInstaller {
    async fn install(&self, lockfile: &Lockfile, platform: &str, prefix: &Path, _ctx: &InstallContext) -> Result<()> {
        let meta = prefix.join("conda-meta");
        fs::create_dir_all(&meta)?;
        if self.behavior == InstallerBehavior::UnreadableRecord {
            fs::create_dir_all(meta.join("broken-0.1-0.json"))?;
        }
        fs::create_dir_all(prefix.join("bin"))?;
        fs::write(prefix.join("bin").join("zlib-config"), "#!/bin/sh\n")?;
        for package in lockfile.conda_packages(platform) {
            let record = json!({
                "name": package.name,
                "version": package.version,
                "build": package.build_string().unwrap_or_default(),
                "build_number": 0,
                "channel": package.channel(),
                "subdir": package.subdir(),
                "sha256": package.hash.sha256,
                "md5": package.hash.md5,
                "size": PACKAGE_BYTES.len(),
            });
            let file = package.filename().trim_end_matches(".conda").to_string();
            fs::write(meta.join(format!("{file}.json")), serde_json::to_vec(&record)?)?;
        }
        Ok(())
    }
}

/// A throwaway envstore deployment
pub struct TestStore {
    pub temp: TempDir,
    pub ctx: Arc<AppContext>,
    pub solver: Arc<FakeSolver>,
}

impl TestStore {
    pub fn new() -> Self {
        Self::with_behavior(SolverBehavior::Succeed)
    }

    pub fn with_behavior(behavior: SolverBehavior) -> Self {
        Self::create(behavior, InstallerBehavior::Succeed)
    }

    pub fn with_installer(installer: InstallerBehavior) -> Self {
        Self::create(SolverBehavior::Succeed, installer)
    }

    fn create(behavior: SolverBehavior, installer: InstallerBehavior) -> Self {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path());
        db::init(&config.storage.database).unwrap();
        let channel = create_channel(temp.path());
        let solver = Arc::new(FakeSolver {
            lockfile: channel_lockfile(&channel),
            behavior,
            database: config.storage.database.clone(),
            calls: AtomicUsize::new(0),
        });
        let ctx = AppContext::new(config)
            .unwrap()
            .with_lock_plugin(solver.clone())
            .with_installer(Arc::new(FakeInstaller { behavior: installer }));
        Self {
            temp,
            ctx: Arc::new(ctx),
            solver,
        }
    }

    pub fn conn(&self) -> rusqlite::Connection {
        self.ctx.open_db().unwrap()
    }

    pub fn store_directory(&self) -> &Path {
        self.ctx.store_directory()
    }

    /// Register `submission` in `namespace` the way the API does
    pub fn submit(&self, namespace: &str, submission: Submission) -> Result<Option<i64>> {
        let mut conn = self.conn();
        register(
            &mut conn,
            self.ctx.defaults(),
            self.store_directory(),
            Registration::new(Some(namespace.to_string()), submission),
        )
    }

    /// Run every due task; returns how many ran
    pub async fn drain(&self) -> usize {
        let pool = WorkerPool::new(self.ctx.clone()).unwrap();
        pool.drain().await.unwrap()
    }

    pub fn build(&self, build_id: i64) -> Build {
        Build::get(&self.conn(), build_id).unwrap()
    }

    /// Server state with a fresh signing key
    pub fn state(&self) -> AppState {
        let authenticator = Authenticator::new(
            TokenSigner::generate(),
            self.ctx.config.auth.clone(),
            Duration::from_secs(3600),
        );
        AppState::new(self.ctx.clone(), authenticator)
    }

    pub fn router(&self, state: &AppState) -> axum::Router {
        create_router(state.clone())
    }
}

/// Token naming `primary` as the holder's namespace
pub fn token(state: &AppState, primary: &str, bindings: &[(&str, &str)]) -> String {
    let mut role_bindings: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (pattern, role) in bindings {
        role_bindings
            .entry(pattern.to_string())
            .or_default()
            .push(role.to_string());
    }
    let claims = Claims {
        exp: Utc::now().timestamp() + 3600,
        primary_namespace: primary.to_string(),
        role_bindings,
    };
    state.authenticator.sign(&claims).unwrap()
}

/// Conda specification with the given dependencies
pub fn specification(name: &str, dependencies: &[&str]) -> Submission {
    Submission::from_value(json!({
        "name": name,
        "channels": ["conda-forge"],
        "dependencies": dependencies,
    }))
    .unwrap()
}

pub fn specification_yaml(name: &str, dependencies: &[&str]) -> String {
    let mut yaml = format!("name: {name}\nchannels:\n  - conda-forge\ndependencies:\n");
    for dependency in dependencies {
        yaml.push_str(&format!("  - {dependency}\n"));
    }
    yaml
}
