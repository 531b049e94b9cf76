// src/db/models/build.rs

//! Build model - one attempt to materialize a specification into a prefix
//!
//! Rows are created here; every status change goes through
//! `crate::build::state` so the lifecycle rules live in one place.

use super::{Page, arn_clause, enum_column};
use crate::db;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Build lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BuildStatus {
    Queued,
    Building,
    Completed,
    Failed,
    Canceled,
    Deleted,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Queued => "QUEUED",
            BuildStatus::Building => "BUILDING",
            BuildStatus::Completed => "COMPLETED",
            BuildStatus::Failed => "FAILED",
            BuildStatus::Canceled => "CANCELED",
            BuildStatus::Deleted => "DELETED",
        }
    }

    /// Terminal states always carry `ended_at`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Completed | BuildStatus::Failed | BuildStatus::Canceled | BuildStatus::Deleted
        )
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(BuildStatus::Queued),
            "BUILDING" => Ok(BuildStatus::Building),
            "COMPLETED" => Ok(BuildStatus::Completed),
            "FAILED" => Ok(BuildStatus::Failed),
            "CANCELED" => Ok(BuildStatus::Canceled),
            "DELETED" => Ok(BuildStatus::Deleted),
            _ => Err(format!("Invalid build status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Build {
    pub id: Option<i64>,
    pub specification_id: i64,
    pub environment_id: i64,
    pub status: BuildStatus,
    pub status_info: Option<String>,
    pub size: i64,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub build_key_version: u8,
}

/// Filters accepted by [`Build::list`]
#[derive(Debug, Clone, Default)]
pub struct BuildFilter {
    pub status: Option<BuildStatus>,
    pub environment_id: Option<i64>,
    pub namespace: Option<String>,
    pub environment: Option<String>,
    pub visible: Vec<(String, String)>,
}

const SELECT: &str = "SELECT b.id, b.specification_id, b.environment_id, b.status, b.status_info,
        b.size, b.scheduled_at, b.started_at, b.ended_at, b.deleted_at, b.build_key_version
    FROM build b";

impl Build {
    pub fn new(specification_id: i64, environment_id: i64, build_key_version: u8) -> Self {
        Self {
            id: None,
            specification_id,
            environment_id,
            status: BuildStatus::Queued,
            status_info: None,
            size: 0,
            scheduled_at: db::now(),
            started_at: None,
            ended_at: None,
            deleted_at: None,
            build_key_version,
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO build (specification_id, environment_id, status, scheduled_at, build_key_version)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                self.specification_id,
                self.environment_id,
                self.status.as_str(),
                self.scheduled_at,
                self.build_key_version,
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let build = conn
            .query_row(&format!("{SELECT} WHERE b.id = ?1"), [id], Self::from_row)
            .optional()?;
        Ok(build)
    }

    /// Like `find_by_id` but a missing row is an error
    pub fn get(conn: &Connection, id: i64) -> Result<Self> {
        Self::find_by_id(conn, id)?.ok_or_else(|| Error::NotFound(format!("build {id}")))
    }

    pub fn find_by_status(conn: &Connection, status: BuildStatus) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!("{SELECT} WHERE b.status = ?1 ORDER BY b.id"))?;
        let builds = stmt
            .query_map([status.as_str()], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(builds)
    }

    pub fn find_by_environment(conn: &Connection, environment_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!("{SELECT} WHERE b.environment_id = ?1 ORDER BY b.id"))?;
        let builds = stmt
            .query_map([environment_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(builds)
    }

    /// Whether a live build of this specification already exists in the namespace
    ///
    /// Failed, canceled and deleted builds do not count, so resubmitting
    /// after a failure schedules a fresh attempt.
    pub fn exists_for_specification(
        conn: &Connection,
        specification_id: i64,
        namespace_id: i64,
    ) -> Result<bool> {
        let exists = conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM build b JOIN environment e ON e.id = b.environment_id
                WHERE b.specification_id = ?1 AND e.namespace_id = ?2
                  AND b.status IN ('QUEUED', 'BUILDING', 'COMPLETED'))",
            params![specification_id, namespace_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn list(conn: &Connection, filter: &BuildFilter, page: Page) -> Result<Vec<Self>> {
        let (clause, mut params) = Self::filter(filter);
        params.push(Box::new(page.limit));
        params.push(Box::new(page.offset));
        let sql = format!(
            "{SELECT} JOIN environment e ON e.id = b.environment_id
                JOIN namespace n ON n.id = e.namespace_id
             WHERE {clause} ORDER BY b.id LIMIT ?{} OFFSET ?{}",
            params.len() - 1,
            params.len()
        );
        let mut stmt = conn.prepare(&sql)?;
        let builds = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(builds)
    }

    pub fn count(conn: &Connection, filter: &BuildFilter) -> Result<i64> {
        let (clause, params) = Self::filter(filter);
        let sql = format!(
            "SELECT COUNT(*) FROM build b JOIN environment e ON e.id = b.environment_id
                JOIN namespace n ON n.id = e.namespace_id WHERE {clause}"
        );
        Ok(conn.query_row(&sql, rusqlite::params_from_iter(params.iter()), |row| row.get(0))?)
    }

    fn filter(filter: &BuildFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        let mut conditions = Vec::new();
        if let Some(status) = filter.status {
            params.push(Box::new(status.as_str()));
            conditions.push(format!("b.status = ?{}", params.len()));
        }
        if let Some(environment_id) = filter.environment_id {
            params.push(Box::new(environment_id));
            conditions.push(format!("b.environment_id = ?{}", params.len()));
        }
        if let Some(namespace) = &filter.namespace {
            params.push(Box::new(namespace.clone()));
            conditions.push(format!("n.name = ?{}", params.len()));
        }
        if let Some(environment) = &filter.environment {
            params.push(Box::new(environment.clone()));
            conditions.push(format!("e.name = ?{}", params.len()));
        }
        conditions.push(
            arn_clause("n.name", Some("e.name"), &filter.visible, &mut params)
                .unwrap_or_else(|| "0".into()),
        );
        (conditions.join(" AND "), params)
    }

    pub fn set_size(conn: &Connection, id: i64, size: i64) -> Result<()> {
        conn.execute("UPDATE build SET size = ?1 WHERE id = ?2", params![size, id])?;
        Ok(())
    }

    /// Associate installed package builds with this build
    pub fn link_package_builds(conn: &Connection, id: i64, package_build_ids: &[i64]) -> Result<()> {
        let mut stmt = conn.prepare(
            "INSERT OR IGNORE INTO build_conda_package_build (build_id, conda_package_build_id)
             VALUES (?1, ?2)",
        )?;
        for package_build_id in package_build_ids {
            stmt.execute(params![id, package_build_id])?;
        }
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            specification_id: row.get(1)?,
            environment_id: row.get(2)?,
            status: enum_column(row, 3)?,
            status_info: row.get(4)?,
            size: row.get(5)?,
            scheduled_at: row.get(6)?,
            started_at: row.get(7)?,
            ended_at: row.get(8)?,
            deleted_at: row.get(9)?,
            build_key_version: row.get(10)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Environment, Namespace, Specification};

    fn setup(conn: &Connection) -> (i64, i64, i64) {
        let ns = Namespace::ensure(conn, "default").unwrap();
        let env = Environment::ensure(conn, &ns, "test", None).unwrap();
        let spec = Specification::new("test".into(), serde_json::json!({}), "s1".into(), false)
            .insert_or_get(conn)
            .unwrap();
        (ns.id.unwrap(), env.id.unwrap(), spec.id.unwrap())
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            BuildStatus::Queued,
            BuildStatus::Building,
            BuildStatus::Completed,
            BuildStatus::Failed,
            BuildStatus::Canceled,
            BuildStatus::Deleted,
        ] {
            assert_eq!(status.as_str().parse::<BuildStatus>().unwrap(), status);
        }
        assert!("RUNNING".parse::<BuildStatus>().is_err());
        assert!(!BuildStatus::Building.is_terminal());
        assert!(BuildStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_insert_and_exists_for_specification() {
        let conn = db::open_in_memory().unwrap();
        let (ns_id, env_id, spec_id) = setup(&conn);
        assert!(!Build::exists_for_specification(&conn, spec_id, ns_id).unwrap());

        let mut build = Build::new(spec_id, env_id, 2);
        let id = build.insert(&conn).unwrap();
        let stored = Build::get(&conn, id).unwrap();
        assert_eq!(stored.status, BuildStatus::Queued);
        assert_eq!(stored.build_key_version, 2);
        assert_eq!(stored.scheduled_at, build.scheduled_at);
        assert!(Build::exists_for_specification(&conn, spec_id, ns_id).unwrap());

        conn.execute("UPDATE build SET status = 'FAILED' WHERE id = ?1", [id])
            .unwrap();
        assert!(!Build::exists_for_specification(&conn, spec_id, ns_id).unwrap());
    }

    #[test]
    fn test_list_by_status() {
        let conn = db::open_in_memory().unwrap();
        let (_, env_id, spec_id) = setup(&conn);
        Build::new(spec_id, env_id, 2).insert(&conn).unwrap();
        Build::new(spec_id, env_id, 2).insert(&conn).unwrap();

        let filter = BuildFilter {
            status: Some(BuildStatus::Queued),
            visible: vec![("*".into(), "*".into())],
            ..Default::default()
        };
        assert_eq!(Build::list(&conn, &filter, Page::new(1, 1)).unwrap().len(), 1);
        assert_eq!(Build::count(&conn, &filter).unwrap(), 2);
        assert_eq!(Build::find_by_status(&conn, BuildStatus::Queued).unwrap().len(), 2);
    }
}
