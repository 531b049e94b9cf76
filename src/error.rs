// src/error.rs

//! Error types for envstore
//!
//! One enum covers every layer. The HTTP layer maps variants onto status
//! codes (see `server::response`), the pipeline maps them onto build states.

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad specification, disallowed channel, missing package, bad setting
    #[error("{0}")]
    Validation(String),

    /// Permission check failed
    #[error("not authorized: {0}")]
    Authorization(String),

    /// Missing row or blob
    #[error("{0} not found")]
    NotFound(String),

    /// Uniqueness violation, duplicate namespace
    #[error("conflict: {0}")]
    Conflict(String),

    /// Storage threshold breached or similar filesystem policy failure
    #[error("{0}")]
    Storage(String),

    /// Install prefix is too long for the platform
    #[error("{0}")]
    BuildPath(String),

    /// Solver, fetch or install failure inside the pipeline
    #[error("build failed: {0}")]
    BuildFailure(String),

    /// Retryable failure (integrity race while indexing channels)
    #[error("transient failure: {0}")]
    Transient(String),

    /// Task was revoked while running
    #[error("task cancelled")]
    Cancelled,

    /// Illegal build state transition
    #[error("invalid build transition for build {build_id}: {from} -> {to}")]
    InvalidTransition {
        build_id: i64,
        from: String,
        to: String,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("object storage error: {0}")]
    ObjectStore(String),
}

impl Error {
    /// Whether the error is a SQLite uniqueness violation
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            Error::Database(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<s3::error::S3Error> for Error {
    fn from(e: s3::error::S3Error) -> Self {
        Error::ObjectStore(e.to_string())
    }
}

impl From<walkdir::Error> for Error {
    fn from(e: walkdir::Error) -> Self {
        Error::Io(std::io::Error::other(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_violation_detection() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (x TEXT UNIQUE); INSERT INTO t VALUES ('a');")
            .unwrap();
        let err: Error = conn
            .execute("INSERT INTO t VALUES ('a')", [])
            .unwrap_err()
            .into();
        assert!(err.is_unique_violation());
        assert!(!Error::NotFound("x".into()).is_unique_violation());
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::NotFound("build 3".into()).to_string(), "build 3 not found");
        let e = Error::InvalidTransition {
            build_id: 1,
            from: "COMPLETED".into(),
            to: "BUILDING".into(),
        };
        assert!(e.to_string().contains("COMPLETED -> BUILDING"));
    }
}
