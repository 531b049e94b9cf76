// src/db/mod.rs

//! Relational index
//!
//! SQLite holds every durable record: namespaces, environments,
//! specifications, builds, artifacts, the channel/package catalog, settings
//! and the task broker. Connections are cheap and opened per operation.

pub mod migrations;
pub mod models;
pub mod schema;

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// How long a writer waits on a locked database before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Create the database (if needed) and bring the schema up to date
pub fn init(db_path: impl AsRef<Path>) -> Result<()> {
    let db_path = db_path.as_ref();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    info!("Initializing database at {}", db_path.display());
    let conn = open(db_path)?;
    schema::migrate(&conn)?;
    Ok(())
}

/// Open a connection with the pragmas every caller relies on
pub fn open(db_path: impl AsRef<Path>) -> Result<Connection> {
    let db_path = db_path.as_ref();
    let conn = Connection::open(db_path).map_err(|e| {
        Error::Config(format!("Failed to open database {}: {e}", db_path.display()))
    })?;
    configure(&conn)?;
    Ok(conn)
}

/// In-memory database with the full schema (tests and dry runs)
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    schema::migrate(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )?;
    // journal_mode returns a row, so it cannot go through execute_batch
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    Ok(())
}

/// Run a closure inside a deferred transaction
pub fn transaction<T, F>(conn: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&Transaction) -> Result<T>,
{
    let tx = conn.transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// Run a closure inside an IMMEDIATE transaction
///
/// Takes the write lock up front; used for state transitions that read a
/// row and then update it.
pub fn immediate<T, F>(conn: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&Transaction) -> Result<T>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// Current time, truncated to microseconds so it round-trips through SQLite
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_and_open() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/envstore.db");
        init(&path).unwrap();
        assert!(path.exists());

        let conn = open(&path).unwrap();
        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
        assert_eq!(
            schema::get_schema_version(&conn).unwrap(),
            schema::SCHEMA_VERSION
        );
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let mut conn = open_in_memory().unwrap();
        let result: Result<()> = transaction(&mut conn, |tx| {
            tx.execute("INSERT INTO namespace (name, metadata) VALUES ('a', '{}')", [])?;
            Err(Error::Validation("boom".into()))
        });
        assert!(result.is_err());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM namespace", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
