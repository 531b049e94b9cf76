// src/build/pipeline.rs

//! Build execution for a single environment build
//!
//! A run goes through fixed stages: lock, fetch, install, permissions,
//! package recording and size accounting. Only after every stage succeeded
//! does [`state::complete`] publish the build, and only a build it made
//! current gets the environment symlink. Any error moves the build to
//! FAILED (or CANCELED when the run was cancelled) and is written to the
//! build log with its full cause chain.

use super::install::{InstallContext, fetch_packages};
use super::key::{self, blob};
use super::lockfile::Lockfile;
use super::plugin::LockContext;
use super::state::{self, Completion};
use super::{BuildInfo, BuildLog};
use crate::context::AppContext;
use crate::db;
use crate::db::models::{
    ArtifactType, Build, BuildStatus, CondaChannel, CondaPackage, CondaPackageBuild, Environment,
};
use crate::environment::spec::{CondaSpecification, Submission, normalize_channel};
use crate::error::{Error, Result};
use crate::queue::{self, Task, TaskKind};
use crate::settings::{Settings, current_platform};
use crate::storage::{PathLock, run_blocking};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Run the build-environment task for `build_id`
///
/// Builds that are no longer QUEUED are left alone. `solve_limit`
/// overrides the `conda_max_solve_time` setting.
pub async fn build_environment(
    ctx: &AppContext,
    build_id: i64,
    cancel: CancellationToken,
    solve_limit: Option<Duration>,
) -> Result<BuildStatus> {
    let info = ctx.db(move |conn| BuildInfo::load(conn, build_id)).await?;
    if info.build.status != BuildStatus::Queued {
        warn!(
            "Build {} is {}, refusing to run it again",
            build_id, info.build.status
        );
        return Ok(info.build.status);
    }

    let key = info.build_key()?;
    let log = BuildLog::new(ctx.store.clone(), build_id, blob::logs(&key));
    let settings = ctx
        .settings(
            Some(info.namespace().to_string()),
            Some(info.environment.name.clone()),
        )
        .await?;
    request_storage_metrics(ctx).await;

    ctx.db(move |conn| state::start(conn, build_id)).await?;
    info!("Building {} ({})", key, info.environment.name);

    let solve_limit = solve_limit.unwrap_or(Duration::from_secs(settings.conda_max_solve_time));
    let run = BuildRun {
        ctx,
        info,
        key,
        settings,
        log: log.clone(),
        cancel,
        solve_limit,
    };
    let outcome = run.execute().await;
    let settings = run.settings;

    let result = match outcome {
        Ok(directory) => {
            let completion = ctx
                .db(move |conn| state::complete(conn, build_id, &directory))
                .await?;
            match completion {
                Completion::Canceled => log.append("build cancelled before completion").await?,
                Completion::Current => {
                    publish_symlink(ctx, build_id, &log).await;
                    log.append("build completed").await?;
                    fan_out(ctx, build_id, &settings).await?;
                }
                Completion::Completed => {
                    log.append("build completed").await?;
                    fan_out(ctx, build_id, &settings).await?;
                }
            }
            Ok(completion.status())
        }
        Err(Error::Cancelled) => {
            let _ = log.append("build cancelled").await;
            ctx.db(move |conn| ignore_transition(state::cancel(conn, build_id, Some("build cancelled"))))
                .await?;
            Err(Error::Cancelled)
        }
        Err(e) => {
            warn!("Build {} failed: {}", build_id, e);
            let _ = log.append(&format!("build failed\n{}", error_chain(&e))).await;
            let status_info = match &e {
                Error::BuildPath(message) => Some(message.clone()),
                _ => None,
            };
            ctx.db(move |conn| ignore_transition(state::fail(conn, build_id, status_info.as_deref())))
                .await?;
            Err(e)
        }
    };

    request_storage_metrics(ctx).await;
    ctx.store.release_logs(build_id);
    result
}

/// Link the environment at a build that just became current
///
/// The build is already COMPLETED, so a failed link is retried through the
/// symlink task instead of failing the build.
async fn publish_symlink(ctx: &AppContext, build_id: i64, log: &BuildLog) {
    let Err(e) = update_environment_symlink(ctx, build_id).await else {
        let _ = log.append("Linked the environment to this build").await;
        return;
    };
    warn!("Failed to link environment of build {}: {}", build_id, e);
    let _ = log.append(&format!("Linking the environment failed: {e}")).await;
    let queued = ctx
        .db(move |conn| {
            Task::new(
                queue::build_task_id(build_id, TaskKind::EnvironmentSymlink),
                TaskKind::EnvironmentSymlink,
                json!({ "build_id": build_id }),
            )
            .enqueue(conn)
        })
        .await;
    if let Err(e) = queued {
        warn!("Failed to queue symlink update for build {}: {}", build_id, e);
    }
}

/// A transition lost to a concurrent cancel or cleanup is not an error here
fn ignore_transition(result: Result<()>) -> Result<()> {
    match result {
        Err(Error::InvalidTransition { build_id, from, to }) => {
            debug!("Build {} already {}, not moving to {}", build_id, from, to);
            Ok(())
        }
        other => other,
    }
}

fn error_chain(error: &Error) -> String {
    let mut out = format!("Error: {error}");
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        out.push_str(&format!("\n  caused by: {cause}"));
        source = std::error::Error::source(cause);
    }
    out
}

async fn request_storage_metrics(ctx: &AppContext) {
    let result = ctx
        .db(|conn| queue::enqueue_singleton(conn, TaskKind::UpdateStorageMetrics))
        .await;
    if let Err(e) = result {
        warn!("Failed to queue storage metrics update: {}", e);
    }
}

/// Queue the export tasks enabled by `build_artifacts`
async fn fan_out(ctx: &AppContext, build_id: i64, settings: &Settings) -> Result<()> {
    let kinds: Vec<TaskKind> = settings
        .build_artifacts
        .iter()
        .filter_map(|artifact| match artifact {
            ArtifactType::Yaml => Some(TaskKind::CondaEnvExport),
            ArtifactType::CondaPack => Some(TaskKind::CondaPack),
            ArtifactType::Installer => Some(TaskKind::Installer),
            _ => None,
        })
        .collect();
    if kinds.is_empty() {
        return Ok(());
    }
    ctx.db(move |conn| {
        for kind in kinds {
            queue::enqueue_derived(conn, build_id, kind)?;
        }
        Ok(())
    })
    .await
}

/// One in-flight build
struct BuildRun<'a> {
    ctx: &'a AppContext,
    info: BuildInfo,
    key: String,
    settings: Settings,
    log: BuildLog,
    cancel: CancellationToken,
    solve_limit: Duration,
}

impl BuildRun<'_> {
    /// Run every stage; returns the prefix recorded as the DIRECTORY artifact
    async fn execute(&self) -> Result<String> {
        let scratch = TempDir::new()?;
        let build_id = self.info.id();

        self.log
            .append(&format!(
                "starting build of conda environment {} UTC",
                Utc::now().format("%Y-%m-%d %H:%M:%S")
            ))
            .await?;
        self.log
            .append(&format!(
                "Settings: conda_command={} solve platforms={} max solve time={}s",
                self.settings.conda_command,
                self.settings.conda_solve_platforms.join(","),
                self.solve_limit.as_secs()
            ))
            .await?;

        let lockfile = self.lock(scratch.path()).await?;
        self.ctx
            .store
            .put(
                build_id,
                &blob::lockfile(&self.key),
                lockfile.to_yaml()?.as_bytes(),
                "text/yaml",
                ArtifactType::Lockfile,
            )
            .await?;
        self.checkpoint()?;

        let platform = lockfile.install_platform(current_platform())?;
        let package_cache = self.ctx.config.storage.package_cache.clone();
        fetch_packages(&self.ctx.http, &lockfile, &platform, &package_cache, &self.log).await?;
        self.checkpoint()?;

        let prefix = self.info.build_path(self.ctx.store_directory())?;
        key::check_prefix_length(&prefix)?;
        self.install(&lockfile, &platform, &prefix, scratch.path(), package_cache)
            .await?;
        self.checkpoint()?;

        self.apply_permissions(&prefix).await?;
        self.record_packages(&prefix).await?;
        self.record_size(&prefix).await?;

        Ok(prefix.to_string_lossy().into_owned())
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Solve the specification, or take the submitted lockfile as-is
    async fn lock(&self, work_dir: &Path) -> Result<Lockfile> {
        match self.info.submission()? {
            Submission::Lockfile(spec) => {
                self.log.append("Using the submitted lockfile").await?;
                Ok(spec.lockfile.normalized())
            }
            Submission::Conda(spec) => {
                let lock_ctx = LockContext {
                    log: self.log.clone(),
                    env: LockContext::forwarded_env(),
                    cancel: self.cancel.clone(),
                    work_dir: work_dir.to_path_buf(),
                    conda_command: self.settings.conda_command.clone(),
                };
                solve_with_limit(self.ctx, &spec, &self.settings, &lock_ctx, self.solve_limit).await
            }
        }
    }

    async fn install(
        &self,
        lockfile: &Lockfile,
        platform: &str,
        prefix: &Path,
        work_dir: &Path,
        package_cache: PathBuf,
    ) -> Result<()> {
        let target = key::os_path(prefix, self.settings.win_extended_length_prefix);
        let stale = target.clone();
        run_blocking(move || {
            if stale.exists() {
                warn!("Removing leftover prefix {}", stale.display());
                fs::remove_dir_all(&stale)?;
            }
            if let Some(parent) = stale.parent() {
                fs::create_dir_all(parent)?;
            }
            Ok(())
        })
        .await?;

        let install_ctx = InstallContext {
            log: self.log.clone(),
            env: LockContext::forwarded_env(),
            cancel: self.cancel.clone(),
            work_dir: work_dir.to_path_buf(),
            package_cache,
            conda_command: self.settings.conda_command.clone(),
        };
        self.log
            .append(&format!("Installing into {}", target.display()))
            .await?;
        self.ctx
            .installer
            .install(lockfile, platform, &target, &install_ctx)
            .await
    }

    async fn apply_permissions(&self, prefix: &Path) -> Result<()> {
        let uid = self.settings.default_uid;
        let gid = self.settings.default_gid;
        let mode = self.settings.permissions_mode()?;
        if uid.is_none() && gid.is_none() && mode.is_none() {
            return Ok(());
        }
        let prefix = prefix.to_path_buf();
        let changed = run_blocking(move || set_ownership(&prefix, uid, gid, mode)).await?;
        self.log
            .append(&format!("Updated ownership or mode of {changed} path(s)"))
            .await
    }

    async fn record_packages(&self, prefix: &Path) -> Result<()> {
        let meta = prefix.join("conda-meta");
        let packages = run_blocking(move || read_conda_meta(&meta)).await?;
        let count = packages.len();
        let build_id = self.info.id();
        let alias = self.settings.conda_channel_alias.clone();
        self.ctx
            .db(move |conn| {
                db::transaction(conn, |tx| {
                    let ids = packages
                        .iter()
                        .map(|package| package.record(tx, &alias))
                        .collect::<Result<Vec<_>>>()?;
                    Build::link_package_builds(tx, build_id, &ids)
                })
            })
            .await?;
        self.log.append(&format!("Recorded {count} installed package(s)")).await
    }

    async fn record_size(&self, prefix: &Path) -> Result<()> {
        let prefix = prefix.to_path_buf();
        let size = run_blocking(move || directory_size(&prefix)).await?;
        let build_id = self.info.id();
        self.ctx
            .db(move |conn| Build::set_size(conn, build_id, size as i64))
            .await?;
        self.log.append(&format!("Environment size: {size} bytes")).await
    }
}

/// Lock `spec` for the solve platforms plus the host, bounded by `limit`
pub async fn solve_with_limit(
    ctx: &AppContext,
    spec: &CondaSpecification,
    settings: &Settings,
    lock_ctx: &LockContext,
    limit: Duration,
) -> Result<Lockfile> {
    let mut platforms = settings.conda_solve_platforms.clone();
    let host = current_platform().to_string();
    if !platforms.contains(&host) {
        platforms.push(host);
    }
    let plugin = &ctx.lock_plugin;
    match tokio::time::timeout(limit, plugin.lock(spec, &platforms, lock_ctx)).await {
        Ok(lockfile) => Ok(lockfile?.normalized()),
        Err(_) => Err(Error::BuildFailure(format!(
            "{} did not finish within {} seconds",
            plugin.name(),
            limit.as_secs()
        ))),
    }
}

/// Atomically replace `link` with a symlink to `target`
///
/// The swap is serialized by a lock file next to the link, so concurrent
/// completions and repoints of one environment cannot interleave.
#[cfg(unix)]
pub fn link_environment(target: &Path, link: &Path) -> Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)?;
    }
    let _lock = PathLock::acquire(PathLock::sidecar(link))?;
    match fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => fs::remove_file(link)?,
        Ok(_) => {
            return Err(Error::Conflict(format!(
                "{} exists and is not a symlink",
                link.display()
            )));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    std::os::unix::fs::symlink(target, link)?;
    debug!("Linked {} -> {}", link.display(), target.display());
    Ok(())
}

#[cfg(not(unix))]
pub fn link_environment(target: &Path, link: &Path) -> Result<()> {
    debug!("Symlinks unsupported, not linking {} -> {}", link.display(), target.display());
    Ok(())
}

/// chown/chmod every non-symlink path under `prefix` that differs
#[cfg(unix)]
fn set_ownership(prefix: &Path, uid: Option<u32>, gid: Option<u32>, mode: Option<u32>) -> Result<usize> {
    use nix::unistd::{Gid, Uid, chown};
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    let mut changed = 0;
    for entry in WalkDir::new(prefix) {
        let entry = entry?;
        if entry.path_is_symlink() {
            continue;
        }
        let meta = entry.metadata()?;
        let uid_differs = uid.is_some_and(|u| u != meta.uid());
        let gid_differs = gid.is_some_and(|g| g != meta.gid());
        if uid_differs || gid_differs {
            chown(entry.path(), uid.map(Uid::from_raw), gid.map(Gid::from_raw))
                .map_err(std::io::Error::from)?;
            changed += 1;
        }
        if let Some(mode) = mode {
            if meta.mode() & 0o7777 != mode {
                fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode))?;
                changed += 1;
            }
        }
    }
    Ok(changed)
}

#[cfg(not(unix))]
fn set_ownership(_prefix: &Path, _uid: Option<u32>, _gid: Option<u32>, _mode: Option<u32>) -> Result<usize> {
    Ok(0)
}

/// Total bytes of regular files under `path`
pub fn directory_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(path) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// One `conda-meta/*.json` record
#[derive(Debug, Clone, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
    pub build: String,
    #[serde(default)]
    pub build_number: i64,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub subdir: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub constrains: Vec<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub license: Option<String>,
}

impl InstalledPackage {
    /// Channel URL without a trailing subdir
    pub fn channel_url(&self, alias: &str) -> String {
        let raw = self.channel.as_deref().unwrap_or("unknown");
        let url = normalize_channel(raw, alias);
        match &self.subdir {
            Some(subdir) => url
                .strip_suffix(&format!("/{subdir}"))
                .map(str::to_string)
                .unwrap_or(url),
            None => url,
        }
    }

    /// Ensure channel, package and package build rows; returns the build row id
    fn record(&self, conn: &rusqlite::Connection, alias: &str) -> Result<i64> {
        let channel = CondaChannel::ensure(conn, &self.channel_url(alias))?;
        let mut package = CondaPackage::new(channel.id.unwrap_or_default(), &self.name, &self.version);
        package.license = self.license.clone();
        let package_id = package.ensure(conn)?;
        CondaPackageBuild {
            id: None,
            package_id,
            build: self.build.clone(),
            build_number: self.build_number,
            subdir: self.subdir.clone(),
            sha256: self.sha256.clone().unwrap_or_default(),
            md5: self.md5.clone().unwrap_or_default(),
            size: self.size.unwrap_or_default(),
            depends: CondaPackageBuild::encode_list(&self.depends),
            constrains: CondaPackageBuild::encode_list(&self.constrains),
            timestamp: self.timestamp,
        }
        .ensure(conn)
    }
}

/// Parse every package record of an installed prefix
pub fn read_conda_meta(dir: &Path) -> Result<Vec<InstalledPackage>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut packages = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        let text = fs::read_to_string(&path)?;
        match serde_json::from_str::<InstalledPackage>(&text) {
            Ok(package) => packages.push(package),
            Err(e) => warn!("Skipping unreadable {}: {}", path.display(), e),
        }
    }
    packages.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(packages)
}

/// Repoint an environment's symlink at its current build
pub async fn update_environment_symlink(ctx: &AppContext, build_id: i64) -> Result<()> {
    let info = ctx.db(move |conn| BuildInfo::load(conn, build_id)).await?;
    let environment_id = info.environment.id.unwrap_or_default();
    let current = ctx
        .db(move |conn| Environment::find_by_id(conn, environment_id))
        .await?
        .and_then(|env| env.current_build_id);
    if current != Some(build_id) {
        info!(
            "Build {} is no longer current for {}, skipping symlink",
            build_id, info.environment.name
        );
        return Ok(());
    }
    let target = info.build_path(ctx.store_directory())?;
    let link = info.environment_path(ctx.store_directory());
    run_blocking(move || link_environment(&target, &link)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_conda_meta() {
        let temp = TempDir::new().unwrap();
        let meta = temp.path().join("conda-meta");
        fs::create_dir_all(&meta).unwrap();
        fs::write(
            meta.join("zlib-1.2.13-h0_0.json"),
            r#"{"name": "zlib", "version": "1.2.13", "build": "h0_0", "build_number": 0,
                "channel": "https://conda.anaconda.org/conda-forge/linux-64",
                "subdir": "linux-64", "sha256": "abc", "md5": "def",
                "depends": ["libgcc-ng >=12"], "size": 10}"#,
        )
        .unwrap();
        fs::write(meta.join("history"), "==> 2024 <==").unwrap();

        let packages = read_conda_meta(&meta).unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(
            packages[0].channel_url("https://conda.anaconda.org"),
            "https://conda.anaconda.org/conda-forge"
        );
        assert!(read_conda_meta(&temp.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_channel_name_expands_under_alias() {
        let package: InstalledPackage = serde_json::from_str(
            r#"{"name": "a", "version": "1", "build": "0", "channel": "conda-forge"}"#,
        )
        .unwrap();
        assert_eq!(
            package.channel_url("https://conda.anaconda.org/"),
            "https://conda.anaconda.org/conda-forge"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_link_environment_replaces_symlink() {
        let temp = TempDir::new().unwrap();
        let first = temp.path().join("build-1");
        let second = temp.path().join("build-2");
        fs::create_dir_all(&first).unwrap();
        fs::create_dir_all(&second).unwrap();
        let link = temp.path().join("envs").join("test");

        link_environment(&first, &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), first);
        link_environment(&second, &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), second);

        let plain = temp.path().join("envs").join("plain");
        fs::create_dir_all(&plain).unwrap();
        assert!(matches!(link_environment(&first, &plain), Err(Error::Conflict(_))));
    }

    #[test]
    fn test_directory_size_counts_files() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("lib")).unwrap();
        fs::write(temp.path().join("a"), vec![0u8; 10]).unwrap();
        fs::write(temp.path().join("lib").join("b"), vec![0u8; 5]).unwrap();
        assert_eq!(directory_size(temp.path()).unwrap(), 15);
    }
}
