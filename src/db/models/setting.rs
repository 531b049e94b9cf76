// src/db/models/setting.rs

//! Key-value settings rows
//!
//! Values are JSON text. Prefixes are `setting`, `setting/{ns}` and
//! `setting/{ns}/{env}`; interpretation lives in `crate::settings`.

use super::json_column;
use crate::error::Result;
use rusqlite::{Connection, Row, params};

#[derive(Debug, Clone, PartialEq)]
pub struct KeyValueSetting {
    pub id: Option<i64>,
    pub prefix: String,
    pub key: String,
    pub value: serde_json::Value,
}

impl KeyValueSetting {
    /// All key/value pairs stored under `prefix`
    pub fn find_by_prefix(conn: &Connection, prefix: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, prefix, key, value FROM key_value_store WHERE prefix = ?1 ORDER BY key",
        )?;
        let rows = stmt
            .query_map([prefix], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Insert or replace the value of `key` under `prefix`
    pub fn upsert(conn: &Connection, prefix: &str, key: &str, value: &serde_json::Value) -> Result<()> {
        conn.execute(
            "INSERT INTO key_value_store (prefix, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(prefix, key) DO UPDATE SET value = excluded.value",
            params![prefix, key, serde_json::to_string(value)?],
        )?;
        Ok(())
    }

    pub fn delete(conn: &Connection, prefix: &str, key: &str) -> Result<usize> {
        Ok(conn.execute(
            "DELETE FROM key_value_store WHERE prefix = ?1 AND key = ?2",
            params![prefix, key],
        )?)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            prefix: row.get(1)?,
            key: row.get(2)?,
            value: json_column(row, 3)?,
        })
    }
}
