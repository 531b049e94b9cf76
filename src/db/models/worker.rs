// src/db/models/worker.rs

//! Worker ready handshake rows

use crate::db;
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: String,
    pub initialized: bool,
    pub created_at: DateTime<Utc>,
}

impl WorkerRecord {
    /// Announce a started worker
    pub fn register(conn: &Connection, id: &str) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO worker (id, initialized, created_at) VALUES (?1, 1, ?2)",
            params![id, db::now()],
        )?;
        Ok(())
    }

    pub fn unregister(conn: &Connection, id: &str) -> Result<()> {
        conn.execute("DELETE FROM worker WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Forget every worker; called by the server on startup
    pub fn delete_all(conn: &Connection) -> Result<usize> {
        Ok(conn.execute("DELETE FROM worker", [])?)
    }

    pub fn any_ready(conn: &Connection) -> Result<bool> {
        Ok(conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM worker WHERE initialized = 1)",
            [],
            |row| row.get(0),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake() {
        let conn = db::open_in_memory().unwrap();
        assert!(!WorkerRecord::any_ready(&conn).unwrap());
        WorkerRecord::register(&conn, "w1").unwrap();
        assert!(WorkerRecord::any_ready(&conn).unwrap());
        assert_eq!(WorkerRecord::delete_all(&conn).unwrap(), 1);
        assert!(!WorkerRecord::any_ready(&conn).unwrap());
    }
}
