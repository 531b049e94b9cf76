// src/db/models/solve.rs

//! Solve model - a dry-run resolution not tied to an installed prefix

use crate::db;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Solve {
    pub id: Option<i64>,
    pub specification_id: i64,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Solve {
    pub fn new(specification_id: i64) -> Self {
        Self {
            id: None,
            specification_id,
            scheduled_at: db::now(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO solve (specification_id, scheduled_at) VALUES (?1, ?2)",
            params![self.specification_id, self.scheduled_at],
        )?;
        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn get(conn: &Connection, id: i64) -> Result<Self> {
        conn.query_row(
            "SELECT id, specification_id, scheduled_at, started_at, ended_at FROM solve WHERE id = ?1",
            [id],
            Self::from_row,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("solve {id}")))
    }

    pub fn mark_started(conn: &Connection, id: i64) -> Result<()> {
        conn.execute(
            "UPDATE solve SET started_at = ?1 WHERE id = ?2",
            params![db::now(), id],
        )?;
        Ok(())
    }

    pub fn mark_ended(conn: &Connection, id: i64) -> Result<()> {
        conn.execute(
            "UPDATE solve SET ended_at = ?1 WHERE id = ?2",
            params![db::now(), id],
        )?;
        Ok(())
    }

    pub fn link_package_builds(conn: &Connection, id: i64, package_build_ids: &[i64]) -> Result<()> {
        let mut stmt = conn.prepare(
            "INSERT OR IGNORE INTO solve_conda_package_build (solve_id, conda_package_build_id)
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
            scheduled_at: row.get(2)?,
            started_at: row.get(3)?,
            ended_at: row.get(4)?,
        })
    }
}
