// src/build/state.rs

//! Build lifecycle transitions
//!
//! Every status change of a build goes through this module. A transition
//! is a guarded `UPDATE ... WHERE status IN (...)`: when no row changes the
//! build either does not exist or is in a state the transition does not
//! accept, and the caller gets `NotFound` or `InvalidTransition`.
//!
//! ```text
//! QUEUED --start--> BUILDING --complete--> COMPLETED --delete--> DELETED
//!   |                  |------fail------> FAILED ----delete--> DELETED
//!   |                  '------cancel----> CANCELED
//!   '-------cancel-----------------------> CANCELED
//! ```

use crate::db;
use crate::db::models::{ArtifactType, Build, BuildArtifact, BuildStatus, Environment};
use crate::error::{Error, Result};
use crate::queue::{self, Task, TaskKind};
use rusqlite::{Connection, params};
use serde_json::json;
use tracing::{debug, info};

fn transition(
    conn: &Connection,
    build_id: i64,
    from: &[BuildStatus],
    to: BuildStatus,
    status_info: Option<&str>,
) -> Result<()> {
    let stamp = match to {
        BuildStatus::Building => "started_at",
        BuildStatus::Deleted => "deleted_at",
        _ => "ended_at",
    };
    let allowed = from
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE build SET status = ?1, {stamp} = ?2, status_info = COALESCE(?3, status_info)
         WHERE id = ?4 AND status IN ({allowed})"
    );

    let changed = conn.execute(&sql, params![to.as_str(), db::now(), status_info, build_id])?;
    if changed == 0 {
        let current = Build::get(conn, build_id)?;
        return Err(Error::InvalidTransition {
            build_id,
            from: current.status.to_string(),
            to: to.to_string(),
        });
    }
    debug!("Build {} -> {}", build_id, to);
    Ok(())
}

/// QUEUED -> BUILDING
pub fn start(conn: &mut Connection, build_id: i64) -> Result<Build> {
    db::immediate(conn, |tx| {
        transition(tx, build_id, &[BuildStatus::Queued], BuildStatus::Building, None)?;
        Build::get(tx, build_id)
    })
}

/// How [`complete`] settled a build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// COMPLETED and now the current build of its environment
    Current,
    /// COMPLETED; the environment kept its existing pointer
    Completed,
    /// The chain was revoked first
    Canceled,
}

impl Completion {
    pub fn status(self) -> BuildStatus {
        match self {
            Completion::Current | Completion::Completed => BuildStatus::Completed,
            Completion::Canceled => BuildStatus::Canceled,
        }
    }
}

/// BUILDING -> COMPLETED, unless the build's chain was revoked first
///
/// The revocation check, the status change, the DIRECTORY artifact and the
/// environment pointer all commit together. A revoked chain ends the build
/// in CANCELED instead. Only a [`Completion::Current`] build may be linked
/// as the environment's symlink.
pub fn complete(conn: &mut Connection, build_id: i64, directory: &str) -> Result<Completion> {
    db::immediate(conn, |tx| {
        if Task::is_chain_revoked(tx, &queue::build_chain_id(build_id))? {
            transition(
                tx,
                build_id,
                &[BuildStatus::Building],
                BuildStatus::Canceled,
                Some("build cancelled"),
            )?;
            info!("Build {} was cancelled before it could complete", build_id);
            return Ok(Completion::Canceled);
        }

        transition(tx, build_id, &[BuildStatus::Building], BuildStatus::Completed, None)?;
        BuildArtifact::new(build_id, ArtifactType::Directory, directory.to_string())
            .insert_or_ignore(tx)?;

        let (environment_id, current, env_name, spec_name, spec_id): (i64, Option<i64>, String, String, i64) =
            tx.query_row(
                "SELECT e.id, e.current_build_id, e.name, s.name, s.id
                 FROM build b
                 JOIN environment e ON e.id = b.environment_id
                 JOIN specification s ON s.id = b.specification_id
                 WHERE b.id = ?1",
                [build_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )?;

        if current.is_none() && env_name == spec_name {
            Environment::set_current_build(tx, environment_id, build_id, spec_id)?;
            info!("Environment {} now points at build {}", env_name, build_id);
            return Ok(Completion::Current);
        }
        Ok(Completion::Completed)
    })
}

/// BUILDING -> FAILED
pub fn fail(conn: &Connection, build_id: i64, status_info: Option<&str>) -> Result<()> {
    transition(conn, build_id, &[BuildStatus::Building], BuildStatus::Failed, status_info)
}

/// QUEUED|BUILDING -> CANCELED
pub fn cancel(conn: &Connection, build_id: i64, status_info: Option<&str>) -> Result<()> {
    transition(
        conn,
        build_id,
        &[BuildStatus::Queued, BuildStatus::Building],
        BuildStatus::Canceled,
        status_info,
    )
}

/// COMPLETED|FAILED -> DELETED and schedule removal of its artifacts
///
/// The current build of an environment cannot be deleted.
pub fn delete(conn: &mut Connection, build_id: i64) -> Result<()> {
    db::immediate(conn, |tx| delete_in(tx, build_id))
}

/// [`delete`] inside a transaction the caller holds
pub fn delete_in(tx: &Connection, build_id: i64) -> Result<()> {
    let in_use: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM environment WHERE current_build_id = ?1)",
        [build_id],
        |row| row.get(0),
    )?;
    if in_use {
        return Err(Error::Conflict(format!(
            "build {build_id} is the current build of its environment"
        )));
    }

    transition(
        tx,
        build_id,
        &[BuildStatus::Completed, BuildStatus::Failed],
        BuildStatus::Deleted,
        None,
    )?;
    Task::new(
        queue::build_task_id(build_id, TaskKind::DeleteBuildArtifacts),
        TaskKind::DeleteBuildArtifacts,
        json!({ "build_id": build_id }),
    )
    .enqueue(tx)?;
    Ok(())
}

/// Ask a queued or running build to stop
///
/// Revokes the build's task chain and schedules a cleanup pass that settles
/// the build once its task has stopped.
pub fn request_cancel(conn: &mut Connection, build_id: i64) -> Result<()> {
    db::immediate(conn, |tx| request_cancel_in(tx, build_id))
}

/// [`request_cancel`] inside a transaction the caller holds
pub fn request_cancel_in(tx: &Connection, build_id: i64) -> Result<()> {
    let build = Build::get(tx, build_id)?;
    if !matches!(build.status, BuildStatus::Queued | BuildStatus::Building) {
        return Err(Error::Validation(format!(
            "build {build_id} is {} and cannot be cancelled",
            build.status
        )));
    }
    Task::revoke(tx, &queue::build_chain_task_ids(build_id))?;
    queue::enqueue_cleanup(tx, &[build_id], Some("build cancelled"))?;
    info!("Cancellation requested for build {}", build_id);
    Ok(())
}

/// Point an environment at one of its completed builds and queue the
/// symlink update
pub fn set_current_build(conn: &mut Connection, environment_id: i64, build_id: i64) -> Result<()> {
    db::immediate(conn, |tx| {
        let build = Build::get(tx, build_id)?;
        if build.environment_id != environment_id {
            return Err(Error::Validation(format!(
                "build {build_id} does not belong to environment {environment_id}"
            )));
        }
        if build.status != BuildStatus::Completed {
            return Err(Error::Validation(format!(
                "build {build_id} is {} and cannot become the current build",
                build.status
            )));
        }
        let (env_name, spec_name): (String, String) = tx.query_row(
            "SELECT e.name, s.name FROM environment e, specification s WHERE e.id = ?1 AND s.id = ?2",
            params![environment_id, build.specification_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if env_name != spec_name {
            return Err(Error::Validation(format!(
                "build {build_id} was built from specification {spec_name}, not {env_name}"
            )));
        }

        Environment::set_current_build(tx, environment_id, build_id, build.specification_id)?;
        Task::new(
            queue::build_task_id(build_id, TaskKind::EnvironmentSymlink),
            TaskKind::EnvironmentSymlink,
            json!({ "build_id": build_id }),
        )
        .enqueue(tx)?;
        info!("Environment {} repointed to build {}", env_name, build_id);
        Ok(())
    })
}
