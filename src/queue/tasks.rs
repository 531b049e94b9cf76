// src/queue/tasks.rs

//! Task bodies
//!
//! [`dispatch`] maps a claimed task onto the function that runs it. Build
//! tasks live in [`crate::build`]; the housekeeping tasks (cleanup,
//! watchdog, path watching, storage metrics, solves) live here.

use super::broker::{Task, TaskKind};
use crate::build::key::blob;
use crate::build::lockfile::{LockedPackage, Lockfile};
use crate::build::pipeline::{self, directory_size, solve_with_limit};
use crate::build::plugin::LockContext;
use crate::build::{BuildInfo, BuildLog, artifacts, state};
use crate::context::AppContext;
use crate::db;
use crate::db::models::{
    ArtifactType, Build, BuildArtifact, BuildStatus, CondaChannel, CondaPackage, CondaPackageBuild,
    Solve, Specification, StorageMetrics,
};
use crate::environment::{Registration, Submission, register};
use crate::error::{Error, Result};
use crate::indexer;
use crate::settings::current_platform;
use crate::storage::{disk_space, run_blocking};
use chrono::Utc;
use rusqlite::Connection;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A BUILDING build younger than this is never settled by cleanup
const SETTLE_GRACE: Duration = Duration::from_secs(5);

/// Run one task to completion
pub async fn dispatch(ctx: &AppContext, task: &Task, cancel: CancellationToken) -> Result<()> {
    match task.kind {
        TaskKind::BuildEnvironment => {
            let build_id = task.arg_i64("build_id")?;
            let limit = task.time_limit_secs.map(Duration::from_secs);
            pipeline::build_environment(ctx, build_id, cancel, limit).await?;
            Ok(())
        }
        TaskKind::CondaEnvExport => artifacts::export_yaml(ctx, task.arg_i64("build_id")?).await,
        TaskKind::CondaPack => artifacts::conda_pack(ctx, task.arg_i64("build_id")?, cancel).await,
        TaskKind::Installer => artifacts::build_installer(ctx, task.arg_i64("build_id")?, cancel).await,
        TaskKind::EnvironmentSymlink => {
            pipeline::update_environment_symlink(ctx, task.arg_i64("build_id")?).await
        }
        TaskKind::DeleteBuildArtifacts => delete_build_artifacts(ctx, task.arg_i64("build_id")?).await,
        TaskKind::Solve => solve(ctx, task.arg_i64("solve_id")?, cancel).await,
        TaskKind::CleanupBuilds => {
            let build_ids: Vec<i64> = task
                .args
                .get("build_ids")
                .and_then(|v| v.as_array())
                .map(|ids| ids.iter().filter_map(|id| id.as_i64()).collect())
                .unwrap_or_default();
            let reason = task.args.get("reason").and_then(|v| v.as_str()).map(str::to_string);
            cleanup_builds(ctx, build_ids, reason).await
        }
        TaskKind::Watchdog => {
            let worker = &ctx.config.worker;
            let stale_after = worker.stale_after().map_err(|e| Error::Config(e.to_string()))?;
            let retention = worker.task_retention().map_err(|e| Error::Config(e.to_string()))?;
            watchdog(ctx, stale_after, Some(retention)).await
        }
        TaskKind::WatchPaths => watch_paths(ctx).await,
        TaskKind::UpdateChannels => indexer::update_channels(ctx).await,
        TaskKind::UpdateStorageMetrics => update_storage_metrics(ctx).await,
    }
}

/// Remove the artifacts of a deleted build
///
/// Artifact types listed in `build_artifacts_kept_on_deletion` stay; the
/// DIRECTORY artifact is the installed prefix itself.
pub async fn delete_build_artifacts(ctx: &AppContext, build_id: i64) -> Result<()> {
    let info = ctx.db(move |conn| BuildInfo::load(conn, build_id)).await?;
    if info.build.status != BuildStatus::Deleted {
        warn!(
            "Build {} is {}, not removing its artifacts",
            build_id, info.build.status
        );
        return Ok(());
    }
    let settings = ctx
        .settings(
            Some(info.namespace().to_string()),
            Some(info.environment.name.clone()),
        )
        .await?;
    let kept = settings.build_artifacts_kept_on_deletion;
    let artifacts = ctx.db(move |conn| BuildArtifact::find_by_build(conn, build_id)).await?;

    let mut removed = 0;
    for artifact in artifacts {
        if kept.contains(&artifact.artifact_type) {
            continue;
        }
        if artifact.artifact_type == ArtifactType::Directory {
            let prefix = info.build_path(ctx.store_directory())?;
            run_blocking(move || remove_prefix(&prefix)).await?;
            let key = artifact.key.clone();
            ctx.db(move |conn| BuildArtifact::delete(conn, build_id, &key)).await?;
        } else {
            match ctx.store.delete(build_id, &artifact.key).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        debug!("Removed {} artifact {} of build {}", artifact.artifact_type, artifact.key, build_id);
        removed += 1;
    }
    info!("Removed {} artifact(s) of deleted build {}", removed, build_id);
    Ok(())
}

fn remove_prefix(prefix: &Path) -> Result<()> {
    match std::fs::remove_dir_all(prefix) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Settle builds whose task is gone
///
/// A BUILDING build that has no active task and started more than
/// `grace` ago ends CANCELED when its chain was revoked and FAILED
/// otherwise. A QUEUED build with a revoked chain ends CANCELED. Returns
/// the builds that changed with their new status.
pub fn settle_builds(
    conn: &Connection,
    build_ids: &[i64],
    active: &HashSet<String>,
    grace: Duration,
    reason: &str,
) -> Result<Vec<(i64, BuildStatus)>> {
    let cutoff = Utc::now() - chrono::Duration::from_std(grace).unwrap_or_default();
    let mut settled = Vec::new();
    for &build_id in build_ids {
        let Some(build) = Build::find_by_id(conn, build_id)? else {
            debug!("Build {} vanished before cleanup", build_id);
            continue;
        };
        let revoked = Task::is_chain_revoked(conn, &super::build_chain_id(build_id))?;
        let outcome = match build.status {
            BuildStatus::Queued if revoked => Some(BuildStatus::Canceled),
            BuildStatus::Building => {
                let running = active.contains(&super::build_task_id(build_id, TaskKind::BuildEnvironment));
                let settled_in = build.started_at.is_none_or(|started| started < cutoff);
                if running || !settled_in {
                    None
                } else if revoked {
                    Some(BuildStatus::Canceled)
                } else {
                    Some(BuildStatus::Failed)
                }
            }
            _ => None,
        };
        let Some(status) = outcome else {
            continue;
        };

        let result = match status {
            BuildStatus::Canceled => state::cancel(conn, build_id, Some(reason)),
            _ => state::fail(conn, build_id, Some(reason)),
        };
        match result {
            Ok(()) => settled.push((build_id, status)),
            Err(Error::InvalidTransition { .. }) => {
                debug!("Build {} moved on before cleanup", build_id);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(settled)
}

/// Append a line to each settled build's log
async fn log_settled(ctx: &AppContext, settled: &[(i64, BuildStatus)], reason: &str) {
    for &(build_id, status) in settled {
        info!("Build {} marked {}: {}", build_id, status, reason);
        let info = match ctx.db(move |conn| BuildInfo::load(conn, build_id)).await {
            Ok(info) => info,
            Err(e) => {
                warn!("Cannot load build {} for its log: {}", build_id, e);
                continue;
            }
        };
        let key = match info.build_key() {
            Ok(key) => key,
            Err(e) => {
                warn!("Cannot derive the key of build {}: {}", build_id, e);
                continue;
            }
        };
        let log = BuildLog::new(ctx.store.clone(), build_id, blob::logs(&key));
        if let Err(e) = log.append(&format!("build marked {status}: {reason}")).await {
            warn!("Failed to append to the log of build {}: {}", build_id, e);
        }
        ctx.store.release_logs(build_id);
    }
}

/// cleanup-builds: settle builds after a cancellation request
pub async fn cleanup_builds(ctx: &AppContext, build_ids: Vec<i64>, reason: Option<String>) -> Result<()> {
    let reason = reason.unwrap_or_else(|| "build task stopped".to_string());
    let stale_after = ctx
        .config
        .worker
        .stale_after()
        .map_err(|e| Error::Config(e.to_string()))?;
    let owned_reason = reason.clone();
    let settled = ctx
        .db(move |conn| {
            let active = Task::active_task_ids(conn, stale_after)?;
            settle_builds(conn, &build_ids, &active, SETTLE_GRACE, &owned_reason)
        })
        .await?;
    log_settled(ctx, &settled, &reason).await;
    Ok(())
}

/// Reconcile BUILDING builds with the tasks the broker still sees running
///
/// Tasks whose heartbeat went stale are failed first, then every BUILDING
/// build without a live task is settled. When the broker cannot report
/// nothing changes. Finished tasks older than `retention` are purged.
pub async fn watchdog(ctx: &AppContext, stale_after: Duration, retention: Option<Duration>) -> Result<()> {
    let active = match ctx.db(move |conn| Task::active_task_ids(conn, stale_after)).await {
        Ok(active) => active,
        Err(e) => {
            warn!("Watchdog cannot list active tasks, leaving builds alone: {}", e);
            return Ok(());
        }
    };

    let reason = "build task is no longer running";
    let settled = ctx
        .db(move |conn| {
            let stale = Task::fail_stale(conn, stale_after)?;
            if stale > 0 {
                warn!("Failed {} task(s) with a stale heartbeat", stale);
            }
            let building: Vec<i64> = Build::find_by_status(conn, BuildStatus::Building)?
                .into_iter()
                .filter_map(|build| build.id)
                .collect();
            settle_builds(conn, &building, &active, SETTLE_GRACE, reason)
        })
        .await?;
    log_settled(ctx, &settled, reason).await;

    if let Some(retention) = retention {
        let purged = ctx.db(move |conn| Task::purge_finished(conn, retention)).await?;
        if purged > 0 {
            debug!("Purged {} finished task(s)", purged);
        }
    }
    Ok(())
}

/// Environment files found under the watched paths
pub fn watched_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_file() {
            files.push(path.clone());
            continue;
        }
        let entries = match std::fs::read_dir(path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read watched path {}: {}", path.display(), e);
                continue;
            }
        };
        for entry in entries.flatten() {
            let file = entry.path();
            let yaml = file
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if yaml && file.is_file() {
                files.push(file);
            }
        }
    }
    files.sort();
    files
}

/// watch-paths: register environment files into the filesystem namespace
///
/// Unchanged files deduplicate against their existing build.
pub async fn watch_paths(ctx: &AppContext) -> Result<()> {
    let paths = ctx.config.worker.watch_paths.clone();
    let files = run_blocking(move || Ok(watched_files(&paths))).await?;
    let namespace = ctx.defaults().filesystem_namespace.clone();

    for file in files {
        let text = match tokio::fs::read_to_string(&file).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Cannot read {}: {}", file.display(), e);
                continue;
            }
        };
        let submission = match Submission::from_yaml(&text) {
            Ok(submission) => submission,
            Err(e) => {
                warn!("Skipping invalid environment file {}: {}", file.display(), e);
                continue;
            }
        };
        let defaults = ctx.defaults().clone();
        let store_directory = ctx.store_directory().to_path_buf();
        let request = Registration::new(Some(namespace.clone()), submission);
        match ctx
            .db(move |conn| register(conn, &defaults, &store_directory, request))
            .await
        {
            Ok(Some(build_id)) => info!("Registered {} as build {}", file.display(), build_id),
            Ok(None) => debug!("{} is already built", file.display()),
            Err(e) => warn!("Failed to register {}: {}", file.display(), e),
        }
    }
    Ok(())
}

/// update-storage-metrics: measure the store directory and its filesystem
pub async fn update_storage_metrics(ctx: &AppContext) -> Result<()> {
    let store_directory = ctx.store_directory().to_path_buf();
    let (usage, free, total) = run_blocking(move || {
        std::fs::create_dir_all(&store_directory)?;
        let usage = directory_size(&store_directory)?;
        let (free, total) = disk_space(&store_directory)?;
        Ok((usage, free, total))
    })
    .await?;
    ctx.db(move |conn| StorageMetrics::store(conn, usage as i64, free as i64, total as i64))
        .await?;
    debug!("Storage: {} used, {} free of {}", usage, free, total);
    Ok(())
}

/// solve: lock a stored specification and link the resolved package builds
pub async fn solve(ctx: &AppContext, solve_id: i64, cancel: CancellationToken) -> Result<()> {
    let specification = ctx
        .db(move |conn| {
            let solve = Solve::get(conn, solve_id)?;
            let specification = Specification::get(conn, solve.specification_id)?;
            Solve::mark_started(conn, solve_id)?;
            Ok(specification)
        })
        .await?;

    let lockfile = match Submission::from_value(specification.spec)? {
        Submission::Lockfile(spec) => spec.lockfile.normalized(),
        Submission::Conda(spec) => {
            let settings = ctx.settings(None, None).await?;
            let scratch = TempDir::new()?;
            let lock_ctx = LockContext {
                log: BuildLog::discard(),
                env: LockContext::forwarded_env(),
                cancel,
                work_dir: scratch.path().to_path_buf(),
                conda_command: settings.conda_command.clone(),
            };
            let limit = Duration::from_secs(settings.conda_max_solve_time);
            solve_with_limit(ctx, &spec, &settings, &lock_ctx, limit).await?
        }
    };

    let count = ctx
        .db(move |conn| db::transaction(conn, |tx| record_solution(tx, solve_id, &lockfile)))
        .await?;
    info!("Solve {} resolved {} package(s)", solve_id, count);
    Ok(())
}

fn record_solution(conn: &Connection, solve_id: i64, lockfile: &Lockfile) -> Result<usize> {
    let platform = lockfile.install_platform(current_platform())?;
    let ids = lockfile
        .conda_packages(&platform)
        .map(|package| record_locked_package(conn, package))
        .collect::<Result<Vec<_>>>()?;
    Solve::link_package_builds(conn, solve_id, &ids)?;
    Solve::mark_ended(conn, solve_id)?;
    Ok(ids.len())
}

/// Package build row for a locked package, reusing an indexed one by sha256
fn record_locked_package(conn: &Connection, package: &LockedPackage) -> Result<i64> {
    if let Some(sha256) = &package.hash.sha256 {
        if let Some(id) = CondaPackageBuild::find_by_sha256(conn, sha256)?.and_then(|b| b.id) {
            return Ok(id);
        }
    }
    let channel = CondaChannel::ensure(conn, package.channel().unwrap_or("unknown"))?;
    let package_id =
        CondaPackage::new(channel.id.unwrap_or_default(), &package.name, &package.version).ensure(conn)?;
    let depends: Vec<String> = package
        .dependencies
        .iter()
        .map(|(name, constraint)| {
            if constraint.is_empty() || constraint == "*" {
                name.clone()
            } else {
                format!("{name} {constraint}")
            }
        })
        .collect();
    CondaPackageBuild {
        id: None,
        package_id,
        build: package.build_string().unwrap_or_default().to_string(),
        build_number: 0,
        subdir: package.subdir().map(str::to_string),
        sha256: package.hash.sha256.clone().unwrap_or_default(),
        md5: package.hash.md5.clone().unwrap_or_default(),
        size: 0,
        depends: CondaPackageBuild::encode_list(&depends),
        constrains: String::new(),
        timestamp: None,
    }
    .ensure(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Environment, Namespace};
    use crate::queue;

    fn queued_build(conn: &Connection) -> i64 {
        let ns = Namespace::ensure(conn, "default").unwrap();
        let env = Environment::ensure(conn, &ns, "test", None).unwrap();
        let spec = Specification::new("test".into(), serde_json::json!({"name": "test"}), "s".into(), false)
            .insert_or_get(conn)
            .unwrap();
        Build::new(spec.id.unwrap(), env.id.unwrap(), 2).insert(conn).unwrap()
    }

    fn backdate_start(conn: &Connection, build_id: i64) {
        conn.execute(
            "UPDATE build SET started_at = ?1 WHERE id = ?2",
            rusqlite::params![Utc::now() - chrono::Duration::seconds(60), build_id],
        )
        .unwrap();
    }

    #[test]
    fn test_settle_orphaned_build_fails() {
        let mut conn = db::open_in_memory().unwrap();
        let build_id = queued_build(&conn);
        state::start(&mut conn, build_id).unwrap();
        backdate_start(&conn, build_id);

        let settled = settle_builds(&conn, &[build_id], &HashSet::new(), SETTLE_GRACE, "gone").unwrap();
        assert_eq!(settled, vec![(build_id, BuildStatus::Failed)]);
        let build = Build::get(&conn, build_id).unwrap();
        assert_eq!(build.status_info.as_deref(), Some("gone"));
        assert!(build.ended_at.is_some());
    }

    #[test]
    fn test_settle_revoked_build_cancels() {
        let mut conn = db::open_in_memory().unwrap();
        let build_id = queued_build(&conn);
        queue::enqueue_build(&conn, build_id, 60).unwrap();
        state::start(&mut conn, build_id).unwrap();
        backdate_start(&conn, build_id);
        Task::revoke(&conn, &queue::build_chain_task_ids(build_id)).unwrap();

        let settled = settle_builds(&conn, &[build_id], &HashSet::new(), SETTLE_GRACE, "cancelled").unwrap();
        assert_eq!(settled, vec![(build_id, BuildStatus::Canceled)]);
    }

    #[test]
    fn test_settle_skips_running_and_fresh_builds() {
        let mut conn = db::open_in_memory().unwrap();
        let running = queued_build(&conn);
        state::start(&mut conn, running).unwrap();
        backdate_start(&conn, running);
        let active: HashSet<String> =
            [queue::build_task_id(running, TaskKind::BuildEnvironment)].into_iter().collect();
        assert!(settle_builds(&conn, &[running], &active, SETTLE_GRACE, "x").unwrap().is_empty());

        let fresh = {
            let spec = Specification::new("test".into(), serde_json::json!({"name": "test", "v": 2}), "t".into(), false)
                .insert_or_get(&conn)
                .unwrap();
            let env = Environment::find_by_name(&conn, "default", "test").unwrap().unwrap();
            Build::new(spec.id.unwrap(), env.id.unwrap(), 2).insert(&conn).unwrap()
        };
        state::start(&mut conn, fresh).unwrap();
        assert!(settle_builds(&conn, &[fresh], &HashSet::new(), SETTLE_GRACE, "x").unwrap().is_empty());
        assert_eq!(Build::get(&conn, fresh).unwrap().status, BuildStatus::Building);
    }

    #[test]
    fn test_settle_queued_build_only_when_revoked() {
        let conn = db::open_in_memory().unwrap();
        let build_id = queued_build(&conn);
        queue::enqueue_build(&conn, build_id, 60).unwrap();
        assert!(settle_builds(&conn, &[build_id], &HashSet::new(), SETTLE_GRACE, "x").unwrap().is_empty());

        Task::revoke(&conn, &[queue::build_chain_id(build_id)]).unwrap();
        let settled = settle_builds(&conn, &[build_id], &HashSet::new(), SETTLE_GRACE, "x").unwrap();
        assert_eq!(settled, vec![(build_id, BuildStatus::Canceled)]);
    }

    #[test]
    fn test_settle_ignores_finished_and_missing_builds() {
        let mut conn = db::open_in_memory().unwrap();
        let build_id = queued_build(&conn);
        state::start(&mut conn, build_id).unwrap();
        state::complete(&mut conn, build_id, "/store/default/k").unwrap();
        let settled = settle_builds(&conn, &[build_id, 999], &HashSet::new(), SETTLE_GRACE, "x").unwrap();
        assert!(settled.is_empty());
        assert_eq!(Build::get(&conn, build_id).unwrap().status, BuildStatus::Completed);
    }

    #[test]
    fn test_watched_files() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.yaml"), "name: a").unwrap();
        std::fs::write(temp.path().join("b.yml"), "name: b").unwrap();
        std::fs::write(temp.path().join("notes.txt"), "x").unwrap();
        let single = temp.path().join("single.conf");
        std::fs::write(&single, "name: c").unwrap();

        let files = watched_files(&[temp.path().to_path_buf(), single.clone(), temp.path().join("missing")]);
        let names: Vec<_> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.yaml", "b.yml", "single.conf"]);
    }

    #[test]
    fn test_record_locked_package_reuses_sha256() {
        let conn = db::open_in_memory().unwrap();
        let lockfile = Lockfile::from_yaml(crate::build::lockfile::tests::SAMPLE).unwrap();
        let package = lockfile.conda_packages("linux-64").next().unwrap();

        let first = record_locked_package(&conn, package).unwrap();
        let second = record_locked_package(&conn, package).unwrap();
        assert_eq!(first, second);
        let stored = CondaPackageBuild::find_by_sha256(&conn, package.hash.sha256.as_deref().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(stored.build, "h5eee18b_0");
        assert_eq!(stored.depends, r#"["libgcc-ng >=11.2.0"]"#);
    }
}
