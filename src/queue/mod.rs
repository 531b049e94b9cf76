// src/queue/mod.rs

//! Background work
//!
//! [`broker`] persists tasks, [`worker`] claims and runs them, and
//! [`tasks`] maps each task kind onto the code that performs it.
//!
//! Task ids are deterministic so that re-enqueueing the same work is a
//! no-op. Every task spawned for a build carries the chain id
//! `build-<id>`; revoking that chain stops the whole build.

pub mod broker;
pub mod tasks;
pub mod worker;

pub use broker::{Task, TaskKind, TaskStatus};
pub use worker::WorkerPool;

use crate::error::Result;
use rusqlite::Connection;
use serde_json::json;
use std::time::Duration;

/// Delay before a cleanup pass so a revoked task has time to stop
pub const CLEANUP_COUNTDOWN: Duration = Duration::from_secs(5);

pub fn build_chain_id(build_id: i64) -> String {
    format!("build-{build_id}")
}

/// Deterministic id of one task of a build
pub fn build_task_id(build_id: i64, kind: TaskKind) -> String {
    let suffix = match kind {
        TaskKind::BuildEnvironment => "environment",
        TaskKind::EnvironmentSymlink => "symlink",
        TaskKind::DeleteBuildArtifacts => "delete",
        other => other.as_str(),
    };
    format!("build-{build_id}-{suffix}")
}

/// Every task id a build chain may have spawned
pub fn build_chain_task_ids(build_id: i64) -> Vec<String> {
    [
        TaskKind::BuildEnvironment,
        TaskKind::CondaEnvExport,
        TaskKind::CondaPack,
        TaskKind::Installer,
    ]
    .into_iter()
    .map(|kind| build_task_id(build_id, kind))
    .chain(std::iter::once(build_chain_id(build_id)))
    .collect()
}

/// Queue the build-environment task heading a build's chain
pub fn enqueue_build(conn: &Connection, build_id: i64, time_limit_secs: u64) -> Result<bool> {
    Task::new(
        build_task_id(build_id, TaskKind::BuildEnvironment),
        TaskKind::BuildEnvironment,
        json!({ "build_id": build_id }),
    )
    .with_chain(build_chain_id(build_id))
    .with_time_limit(time_limit_secs)
    .enqueue(conn)
}

/// Queue a derived task of a completed build
pub fn enqueue_derived(conn: &Connection, build_id: i64, kind: TaskKind) -> Result<bool> {
    Task::new(build_task_id(build_id, kind), kind, json!({ "build_id": build_id }))
        .with_chain(build_chain_id(build_id))
        .enqueue(conn)
}

/// Queue a cleanup pass for the given builds, or for all stuck builds
pub fn enqueue_cleanup(conn: &Connection, build_ids: &[i64], reason: Option<&str>) -> Result<bool> {
    let id = match build_ids {
        [single] => format!("cleanup-builds-{single}"),
        _ => format!("cleanup-builds-{}", uuid::Uuid::new_v4()),
    };
    Task::new(
        id,
        TaskKind::CleanupBuilds,
        json!({ "build_ids": build_ids, "reason": reason }),
    )
    .with_countdown(CLEANUP_COUNTDOWN)
    .enqueue(conn)
}

/// Queue a periodic or singleton task under its kind name
pub fn enqueue_singleton(conn: &Connection, kind: TaskKind) -> Result<bool> {
    Task::new(kind.as_str(), kind, json!({})).enqueue(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids() {
        assert_eq!(build_chain_id(7), "build-7");
        assert_eq!(build_task_id(7, TaskKind::BuildEnvironment), "build-7-environment");
        assert_eq!(build_task_id(7, TaskKind::CondaPack), "build-7-conda-pack");
        assert_eq!(build_task_id(7, TaskKind::EnvironmentSymlink), "build-7-symlink");
        assert_eq!(build_chain_task_ids(7).len(), 5);
    }
}
