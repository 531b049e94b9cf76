// src/db/models/channel.rs

//! Conda channel model - a source of package metadata

use super::Page;
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct CondaChannel {
    pub id: Option<i64>,
    /// Normalized channel URL
    pub name: String,
    pub last_update: Option<DateTime<Utc>>,
}

impl CondaChannel {
    /// Fetch or create the channel row for `name`
    pub fn ensure(conn: &Connection, name: &str) -> Result<Self> {
        conn.execute(
            "INSERT INTO conda_channel (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
            [name],
        )?;
        let channel = conn.query_row(
            "SELECT id, name, last_update FROM conda_channel WHERE name = ?1",
            [name],
            Self::from_row,
        )?;
        Ok(channel)
    }

    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let channel = conn
            .query_row(
                "SELECT id, name, last_update FROM conda_channel WHERE name = ?1",
                [name],
                Self::from_row,
            )
            .optional()?;
        Ok(channel)
    }

    pub fn list(conn: &Connection, page: Page) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, last_update FROM conda_channel ORDER BY name LIMIT ?1 OFFSET ?2",
        )?;
        let channels = stmt
            .query_map(params![page.limit, page.offset], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(channels)
    }

    pub fn count(conn: &Connection) -> Result<i64> {
        Ok(conn.query_row("SELECT COUNT(*) FROM conda_channel", [], |row| row.get(0))?)
    }

    pub fn set_last_update(conn: &Connection, id: i64, when: DateTime<Utc>) -> Result<()> {
        conn.execute(
            "UPDATE conda_channel SET last_update = ?1 WHERE id = ?2",
            params![when, id],
        )?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            last_update: row.get(2)?,
        })
    }
}
