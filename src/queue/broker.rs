// src/queue/broker.rs

//! Durable task broker
//!
//! Tasks live in the `task` table so they survive restarts and can be
//! claimed by any worker process sharing the database. A claimed task is
//! kept alive by heartbeats; a task whose heartbeat goes stale is no longer
//! reported as active, which is what the watchdog keys on.

use crate::db;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What a task does; stored in the `name` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    BuildEnvironment,
    CondaEnvExport,
    CondaPack,
    Installer,
    EnvironmentSymlink,
    DeleteBuildArtifacts,
    Solve,
    CleanupBuilds,
    Watchdog,
    WatchPaths,
    UpdateChannels,
    UpdateStorageMetrics,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::BuildEnvironment => "build-environment",
            TaskKind::CondaEnvExport => "conda-env-export",
            TaskKind::CondaPack => "conda-pack",
            TaskKind::Installer => "installer",
            TaskKind::EnvironmentSymlink => "environment-symlink",
            TaskKind::DeleteBuildArtifacts => "delete-build-artifacts",
            TaskKind::Solve => "solve",
            TaskKind::CleanupBuilds => "cleanup-builds",
            TaskKind::Watchdog => "watchdog",
            TaskKind::WatchPaths => "watch-paths",
            TaskKind::UpdateChannels => "update-channels",
            TaskKind::UpdateStorageMetrics => "update-storage-metrics",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("Invalid task kind: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Started,
    Succeeded,
    Failed,
    Revoked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Started => "started",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Revoked => "revoked",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "started" => Ok(TaskStatus::Started),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "revoked" => Ok(TaskStatus::Revoked),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

/// A persisted task
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    /// Group id used for cancellation (`build-B`)
    pub chain_id: Option<String>,
    pub kind: TaskKind,
    pub args: serde_json::Value,
    pub status: TaskStatus,
    /// Not claimable before this instant
    pub eta: DateTime<Utc>,
    pub time_limit_secs: Option<u64>,
    pub worker_id: Option<String>,
    pub revoked: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

const COLUMNS: &str = "id, chain_id, name, args, status, eta, time_limit_secs, worker_id, revoked,
    error, created_at, started_at, heartbeat_at, finished_at";

impl Task {
    pub fn new(id: impl Into<String>, kind: TaskKind, args: serde_json::Value) -> Self {
        let now = db::now();
        Self {
            id: id.into(),
            chain_id: None,
            kind,
            args,
            status: TaskStatus::Pending,
            eta: now,
            time_limit_secs: None,
            worker_id: None,
            revoked: false,
            error: None,
            created_at: now,
            started_at: None,
            heartbeat_at: None,
            finished_at: None,
        }
    }

    pub fn with_chain(mut self, chain_id: impl Into<String>) -> Self {
        self.chain_id = Some(chain_id.into());
        self
    }

    /// Delay the task by `delay`
    pub fn with_countdown(mut self, delay: Duration) -> Self {
        self.eta = self.created_at + chrono::Duration::from_std(delay).unwrap_or_default();
        self
    }

    pub fn with_time_limit(mut self, secs: u64) -> Self {
        self.time_limit_secs = Some(secs);
        self
    }

    /// Integer argument by name (build or solve id)
    pub fn arg_i64(&self, name: &str) -> Result<i64> {
        self.args
            .get(name)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| Error::Validation(format!("task {} is missing argument {name}", self.id)))
    }

    /// Queue the task
    ///
    /// Idempotent while a task with the same id is pending or started. A
    /// finished, unrevoked task with the same id is reset and queued again.
    /// Returns whether the task will run.
    pub fn enqueue(&self, conn: &Connection) -> Result<bool> {
        let changed = conn.execute(
            "INSERT INTO task (id, chain_id, name, args, status, eta, time_limit_secs, revoked, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, 0, ?7)
             ON CONFLICT(id) DO UPDATE SET
                status = 'pending', args = excluded.args, eta = excluded.eta,
                time_limit_secs = excluded.time_limit_secs, worker_id = NULL, error = NULL,
                created_at = excluded.created_at, started_at = NULL, heartbeat_at = NULL,
                finished_at = NULL
             WHERE task.status IN ('succeeded', 'failed') AND task.revoked = 0",
            params![
                &self.id,
                &self.chain_id,
                self.kind.as_str(),
                serde_json::to_string(&self.args)?,
                self.eta,
                self.time_limit_secs,
                self.created_at,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<Self>> {
        let sql = format!("SELECT {COLUMNS} FROM task WHERE id = ?1");
        Ok(conn.query_row(&sql, [id], Self::from_row).optional()?)
    }

    /// Atomically take the oldest due task for `worker_id`
    pub fn claim(conn: &mut Connection, worker_id: &str) -> Result<Option<Self>> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = db::now();
        let task = tx
            .query_row(
                &format!(
                    "UPDATE task SET status = 'started', worker_id = ?1, started_at = ?2, heartbeat_at = ?2
                     WHERE id = (
                        SELECT id FROM task
                        WHERE status = 'pending' AND revoked = 0 AND eta <= ?2
                        ORDER BY eta, created_at LIMIT 1)
                     RETURNING {COLUMNS}"
                ),
                params![worker_id, now],
                Self::from_row,
            )
            .optional()?;
        tx.commit()?;
        Ok(task)
    }

    pub fn heartbeat(conn: &Connection, id: &str) -> Result<()> {
        conn.execute(
            "UPDATE task SET heartbeat_at = ?1 WHERE id = ?2 AND status = 'started'",
            params![db::now(), id],
        )?;
        Ok(())
    }

    /// Record the outcome of a started task
    ///
    /// A task revoked while running ends as `revoked` whatever it returned.
    pub fn finish(conn: &Connection, id: &str, error: Option<&str>) -> Result<()> {
        conn.execute(
            "UPDATE task SET
                status = CASE WHEN revoked = 1 THEN 'revoked'
                              WHEN ?2 IS NULL THEN 'succeeded'
                              ELSE 'failed' END,
                error = ?2, finished_at = ?3
             WHERE id = ?1",
            params![id, error, db::now()],
        )?;
        Ok(())
    }

    /// Revoke tasks by task id or chain id
    ///
    /// Pending tasks never start; started tasks see the flag through
    /// [`Task::is_revoked`]. Returns the number of tasks touched.
    pub fn revoke(conn: &Connection, ids: &[String]) -> Result<usize> {
        let mut total = 0;
        let now = db::now();
        for id in ids {
            total += conn.execute(
                "UPDATE task SET
                    revoked = 1,
                    status = CASE WHEN status = 'pending' THEN 'revoked' ELSE status END,
                    finished_at = CASE WHEN status = 'pending' THEN ?2 ELSE finished_at END
                 WHERE id = ?1 OR chain_id = ?1",
                params![id, now],
            )?;
        }
        Ok(total)
    }

    pub fn is_revoked(conn: &Connection, id: &str) -> Result<bool> {
        let revoked: Option<bool> = conn
            .query_row("SELECT revoked FROM task WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        Ok(revoked.unwrap_or(false))
    }

    /// Whether any task of the chain has been revoked
    pub fn is_chain_revoked(conn: &Connection, chain_id: &str) -> Result<bool> {
        Ok(conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM task WHERE (chain_id = ?1 OR id = ?1) AND revoked = 1)",
            [chain_id],
            |row| row.get(0),
        )?)
    }

    /// Ids of started tasks with a heartbeat newer than `stale_after`
    pub fn active_task_ids(conn: &Connection, stale_after: Duration) -> Result<HashSet<String>> {
        let cutoff = db::now() - chrono::Duration::from_std(stale_after).unwrap_or_default();
        let mut stmt =
            conn.prepare("SELECT id FROM task WHERE status = 'started' AND heartbeat_at >= ?1")?;
        let ids = stmt
            .query_map([cutoff], |row| row.get(0))?
            .collect::<std::result::Result<HashSet<String>, _>>()?;
        Ok(ids)
    }

    /// Fail started tasks whose worker stopped heartbeating
    pub fn fail_stale(conn: &Connection, stale_after: Duration) -> Result<usize> {
        let cutoff = db::now() - chrono::Duration::from_std(stale_after).unwrap_or_default();
        Ok(conn.execute(
            "UPDATE task SET status = 'failed', error = 'worker lost', finished_at = ?2
             WHERE status = 'started' AND heartbeat_at < ?1",
            params![cutoff, db::now()],
        )?)
    }

    /// Fail every task a given worker had started (worker restart)
    pub fn fail_worker_tasks(conn: &Connection, worker_id: &str) -> Result<usize> {
        Ok(conn.execute(
            "UPDATE task SET status = 'failed', error = 'worker restarted', finished_at = ?2
             WHERE status = 'started' AND worker_id = ?1",
            params![worker_id, db::now()],
        )?)
    }

    /// Delete finished tasks older than `age`
    pub fn purge_finished(conn: &Connection, age: Duration) -> Result<usize> {
        let cutoff = db::now() - chrono::Duration::from_std(age).unwrap_or_default();
        Ok(conn.execute(
            "DELETE FROM task WHERE status IN ('succeeded', 'failed', 'revoked') AND finished_at < ?1",
            [cutoff],
        )?)
    }

    pub fn list_by_status(conn: &Connection, status: TaskStatus) -> Result<Vec<Self>> {
        let sql = format!("SELECT {COLUMNS} FROM task WHERE status = ?1 ORDER BY eta, created_at");
        let mut stmt = conn.prepare(&sql)?;
        let tasks = stmt
            .query_map([status.as_str()], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            chain_id: row.get(1)?,
            kind: crate::db::models::enum_column(row, 2)?,
            args: crate::db::models::json_column(row, 3)?,
            status: crate::db::models::enum_column(row, 4)?,
            eta: row.get(5)?,
            time_limit_secs: row.get(6)?,
            worker_id: row.get(7)?,
            revoked: row.get(8)?,
            error: row.get(9)?,
            created_at: row.get(10)?,
            started_at: row.get(11)?,
            heartbeat_at: row.get(12)?,
            finished_at: row.get(13)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_names() {
        assert_eq!(TaskKind::BuildEnvironment.as_str(), "build-environment");
        assert_eq!("conda-pack".parse::<TaskKind>().unwrap(), TaskKind::CondaPack);
        assert!("bogus".parse::<TaskKind>().is_err());
    }

    #[test]
    fn test_enqueue_is_idempotent_while_pending() {
        let conn = db::open_in_memory().unwrap();
        let task = Task::new("build-1-environment", TaskKind::BuildEnvironment, json!({"build_id": 1}))
            .with_chain("build-1");
        assert!(task.enqueue(&conn).unwrap());
        assert!(!task.enqueue(&conn).unwrap());
        assert_eq!(Task::list_by_status(&conn, TaskStatus::Pending).unwrap().len(), 1);
    }

    #[test]
    fn test_claim_finish_and_requeue() {
        let mut conn = db::open_in_memory().unwrap();
        Task::new("watchdog", TaskKind::Watchdog, json!({})).enqueue(&conn).unwrap();

        let claimed = Task::claim(&mut conn, "w1").unwrap().unwrap();
        assert_eq!(claimed.status, TaskStatus::Started);
        assert_eq!(claimed.worker_id.as_deref(), Some("w1"));
        assert!(Task::claim(&mut conn, "w2").unwrap().is_none());

        Task::finish(&conn, "watchdog", None).unwrap();
        let done = Task::find_by_id(&conn, "watchdog").unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);

        // periodic tasks reuse their id
        assert!(Task::new("watchdog", TaskKind::Watchdog, json!({})).enqueue(&conn).unwrap());
        assert!(Task::claim(&mut conn, "w1").unwrap().is_some());
    }

    #[test]
    fn test_countdown_delays_claim() {
        let mut conn = db::open_in_memory().unwrap();
        Task::new("cleanup-builds-1", TaskKind::CleanupBuilds, json!({}))
            .with_countdown(Duration::from_secs(60))
            .enqueue(&conn)
            .unwrap();
        assert!(Task::claim(&mut conn, "w1").unwrap().is_none());
    }

    #[test]
    fn test_revoke_by_chain() {
        let mut conn = db::open_in_memory().unwrap();
        Task::new("build-1-environment", TaskKind::BuildEnvironment, json!({"build_id": 1}))
            .with_chain("build-1")
            .enqueue(&conn)
            .unwrap();
        Task::new("build-2-environment", TaskKind::BuildEnvironment, json!({"build_id": 2}))
            .with_chain("build-2")
            .enqueue(&conn)
            .unwrap();

        let started = Task::claim(&mut conn, "w1").unwrap().unwrap();
        assert_eq!(started.id, "build-1-environment");

        assert_eq!(Task::revoke(&conn, &["build-1".into(), "build-2".into()]).unwrap(), 2);
        assert!(Task::is_revoked(&conn, "build-1-environment").unwrap());
        assert!(Task::is_chain_revoked(&conn, "build-1").unwrap());

        // the pending one is gone, the started one ends revoked
        assert!(Task::claim(&mut conn, "w1").unwrap().is_none());
        Task::finish(&conn, "build-1-environment", None).unwrap();
        let finished = Task::find_by_id(&conn, "build-1-environment").unwrap().unwrap();
        assert_eq!(finished.status, TaskStatus::Revoked);

        // a revoked id cannot be resurrected by enqueue
        let again = Task::new("build-2-environment", TaskKind::BuildEnvironment, json!({"build_id": 2}));
        assert!(!again.enqueue(&conn).unwrap());
    }

    #[test]
    fn test_active_ids_follow_heartbeats() {
        let mut conn = db::open_in_memory().unwrap();
        Task::new("t1", TaskKind::Watchdog, json!({})).enqueue(&conn).unwrap();
        Task::claim(&mut conn, "w1").unwrap();

        let active = Task::active_task_ids(&conn, Duration::from_secs(60)).unwrap();
        assert!(active.contains("t1"));

        conn.execute(
            "UPDATE task SET heartbeat_at = ?1 WHERE id = 't1'",
            [db::now() - chrono::Duration::minutes(10)],
        )
        .unwrap();
        assert!(Task::active_task_ids(&conn, Duration::from_secs(60)).unwrap().is_empty());
        assert_eq!(Task::fail_stale(&conn, Duration::from_secs(60)).unwrap(), 1);
    }
}
