// src/db/schema.rs

//! Schema version tracking
//!
//! Migrations are applied in order on startup until the database reaches
//! `SCHEMA_VERSION`. Each version lives in `db::migrations`.

use super::migrations;
use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 4;

fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version: Option<i32> = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    migrate_to(conn, SCHEMA_VERSION)
}

/// Apply pending migrations up to (and including) `target`
pub fn migrate_to(conn: &Connection, target: i32) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version >= target {
        return Ok(());
    }

    for version in (current_version + 1)..=target {
        info!("Applying migration to version {}", version);
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let applied = apply_migration(conn, version).and_then(|_| set_schema_version(conn, version));
        match applied {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(e) => {
                conn.execute_batch("ROLLBACK")?;
                return Err(e);
            }
        }
    }

    info!("Schema migration complete. Now at version {}", target);
    Ok(())
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrations::migrate_v1(conn),
        2 => migrations::migrate_v2(conn),
        3 => migrations::migrate_v3(conn),
        4 => migrations::migrate_v4(conn),
        _ => Err(Error::Config(format!("Unknown migration version: {version}"))),
    }
}
