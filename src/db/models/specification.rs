// src/db/models/specification.rs

//! Specification model - content-addressed, immutable environment descriptions

use super::json_column;
use crate::db;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Specification {
    pub id: Option<i64>,
    pub name: String,
    pub spec: serde_json::Value,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
    pub is_lockfile: bool,
}

const COLUMNS: &str = "id, name, spec, sha256, created_at, is_lockfile";

impl Specification {
    pub fn new(name: String, spec: serde_json::Value, sha256: String, is_lockfile: bool) -> Self {
        Self {
            id: None,
            name,
            spec,
            sha256,
            created_at: db::now(),
            is_lockfile,
        }
    }

    /// Insert unless a row with the same sha256 exists; either way return the stored row
    ///
    /// Rows are never updated, so a concurrent insert of the same content
    /// resolves to the winner's row.
    pub fn insert_or_get(mut self, conn: &Connection) -> Result<Self> {
        conn.execute(
            "INSERT INTO specification (name, spec, sha256, created_at, is_lockfile)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(sha256) DO NOTHING",
            params![
                &self.name,
                serde_json::to_string(&self.spec)?,
                &self.sha256,
                self.created_at,
                self.is_lockfile,
            ],
        )?;

        match Self::find_by_sha256(conn, &self.sha256)? {
            Some(stored) => Ok(stored),
            None => {
                self.id = Some(conn.last_insert_rowid());
                Ok(self)
            }
        }
    }

    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let sql = format!("SELECT {COLUMNS} FROM specification WHERE id = ?1");
        Ok(conn.query_row(&sql, [id], Self::from_row).optional()?)
    }

    pub fn get(conn: &Connection, id: i64) -> Result<Self> {
        Self::find_by_id(conn, id)?.ok_or_else(|| Error::NotFound(format!("specification {id}")))
    }

    pub fn find_by_sha256(conn: &Connection, sha256: &str) -> Result<Option<Self>> {
        let sql = format!("SELECT {COLUMNS} FROM specification WHERE sha256 = ?1");
        Ok(conn.query_row(&sql, [sha256], Self::from_row).optional()?)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            spec: json_column(row, 2)?,
            sha256: row.get(3)?,
            created_at: row.get(4)?,
            is_lockfile: row.get(5)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_or_get_dedupes_on_sha256() {
        let conn = db::open_in_memory().unwrap();
        let spec = serde_json::json!({"name": "test", "dependencies": ["zlib"]});
        let a = Specification::new("test".into(), spec.clone(), "abc".into(), false)
            .insert_or_get(&conn)
            .unwrap();
        let b = Specification::new("test".into(), spec, "abc".into(), false)
            .insert_or_get(&conn)
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.spec["dependencies"][0], "zlib");

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM specification", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
