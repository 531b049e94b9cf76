// src/db/models/storage_metrics.rs

//! Disk usage snapshot for the store directory (single row)

use crate::db;
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageMetrics {
    pub disk_usage: i64,
    pub free_storage: i64,
    pub total_storage: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StorageMetrics {
    /// Current snapshot; all zeros before the first measurement
    pub fn get(conn: &Connection) -> Result<Self> {
        let metrics = conn
            .query_row(
                "SELECT disk_usage, free_storage, total_storage, updated_at
                 FROM storage_metrics WHERE id = 1",
                [],
                |row| {
                    Ok(Self {
                        disk_usage: row.get(0)?,
                        free_storage: row.get(1)?,
                        total_storage: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(metrics.unwrap_or_default())
    }

    pub fn store(conn: &Connection, disk_usage: i64, free_storage: i64, total_storage: i64) -> Result<()> {
        conn.execute(
            "INSERT INTO storage_metrics (id, disk_usage, free_storage, total_storage, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET disk_usage = excluded.disk_usage,
                free_storage = excluded.free_storage,
                total_storage = excluded.total_storage,
                updated_at = excluded.updated_at",
            params![disk_usage, free_storage, total_storage, db::now()],
        )?;
        Ok(())
    }
}
