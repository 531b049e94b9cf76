// src/db/models/namespace.rs

//! Namespace model - the tenancy boundary that owns environments

use super::{Page, arn_clause, json_column};
use crate::db;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Namespace {
    pub id: Option<i64>,
    pub name: String,
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

const COLUMNS: &str = "id, name, metadata, deleted_at";

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            metadata: serde_json::json!({}),
            deleted_at: None,
        }
    }

    /// Insert this namespace; a duplicate name is a conflict
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        let metadata = serde_json::to_string(&self.metadata)?;
        conn.execute(
            "INSERT INTO namespace (name, metadata) VALUES (?1, ?2)",
            params![&self.name, metadata],
        )
        .map_err(|e| {
            let err = Error::from(e);
            if err.is_unique_violation() {
                Error::Conflict(format!("namespace {} already exists", self.name))
            } else {
                err
            }
        })?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Fetch the active namespace called `name`, creating it when missing
    ///
    /// A soft-deleted namespace of the same name is revived.
    pub fn ensure(conn: &Connection, name: &str) -> Result<Self> {
        if let Some(existing) = Self::find_by_name(conn, name)? {
            return Ok(existing);
        }
        let revived = conn.execute(
            "UPDATE namespace SET deleted_at = NULL WHERE name = ?1 AND deleted_at IS NOT NULL",
            [name],
        )?;
        if revived > 0 {
            return Self::find_by_name(conn, name)?
                .ok_or_else(|| Error::NotFound(format!("namespace {name}")));
        }
        let mut namespace = Self::new(name);
        namespace.insert(conn)?;
        Ok(namespace)
    }

    /// Find an active (not soft-deleted) namespace by name
    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let sql = format!("SELECT {COLUMNS} FROM namespace WHERE name = ?1 AND deleted_at IS NULL");
        let namespace = conn.query_row(&sql, [name], Self::from_row).optional()?;
        Ok(namespace)
    }

    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let sql = format!("SELECT {COLUMNS} FROM namespace WHERE id = ?1");
        let namespace = conn.query_row(&sql, [id], Self::from_row).optional()?;
        Ok(namespace)
    }

    /// List active namespaces visible through the given ARN namespace globs
    pub fn list(conn: &Connection, visible: &[(String, String)], page: Page) -> Result<Vec<Self>> {
        let (clause, mut params) = Self::filter(visible);
        params.push(Box::new(page.limit));
        params.push(Box::new(page.offset));
        let sql = format!(
            "SELECT {COLUMNS} FROM namespace n WHERE n.deleted_at IS NULL AND {clause}
             ORDER BY n.name LIMIT ?{} OFFSET ?{}",
            params.len() - 1,
            params.len()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count(conn: &Connection, visible: &[(String, String)]) -> Result<i64> {
        let (clause, params) = Self::filter(visible);
        let sql = format!("SELECT COUNT(*) FROM namespace n WHERE n.deleted_at IS NULL AND {clause}");
        let count = conn.query_row(&sql, rusqlite::params_from_iter(params.iter()), |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    fn filter(visible: &[(String, String)]) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        let clause = arn_clause("n.name", None, visible, &mut params).unwrap_or_else(|| "0".into());
        (clause, params)
    }

    pub fn update_metadata(&mut self, conn: &Connection, metadata: serde_json::Value) -> Result<()> {
        let id = self.id.ok_or_else(|| Error::NotFound("namespace".into()))?;
        conn.execute(
            "UPDATE namespace SET metadata = ?1 WHERE id = ?2",
            params![serde_json::to_string(&metadata)?, id],
        )?;
        self.metadata = metadata;
        Ok(())
    }

    /// Soft-delete the namespace and every environment in it
    pub fn soft_delete(&mut self, conn: &Connection) -> Result<()> {
        let id = self.id.ok_or_else(|| Error::NotFound("namespace".into()))?;
        let now = db::now();
        conn.execute(
            "UPDATE environment SET deleted_at = ?1 WHERE namespace_id = ?2 AND deleted_at IS NULL",
            params![now, id],
        )?;
        conn.execute("UPDATE namespace SET deleted_at = ?1 WHERE id = ?2", params![now, id])?;
        self.deleted_at = Some(now);
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            metadata: json_column(row, 2)?,
            deleted_at: row.get(3)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_and_conflict() {
        let conn = db::open_in_memory().unwrap();
        let ns = Namespace::ensure(&conn, "default").unwrap();
        let again = Namespace::ensure(&conn, "default").unwrap();
        assert_eq!(ns.id, again.id);

        let err = Namespace::new("default").insert(&conn).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_soft_delete_hides_and_ensure_revives() {
        let conn = db::open_in_memory().unwrap();
        let mut ns = Namespace::ensure(&conn, "team").unwrap();
        ns.soft_delete(&conn).unwrap();
        assert!(Namespace::find_by_name(&conn, "team").unwrap().is_none());

        let revived = Namespace::ensure(&conn, "team").unwrap();
        assert_eq!(revived.id, ns.id);
        assert!(revived.deleted_at.is_none());
    }

    #[test]
    fn test_list_filters_by_glob() {
        let conn = db::open_in_memory().unwrap();
        for name in ["alpha", "alpine", "beta"] {
            Namespace::ensure(&conn, name).unwrap();
        }
        let visible = vec![("al*".to_string(), "*".to_string())];
        let names: Vec<String> = Namespace::list(&conn, &visible, Page::new(1, 10))
            .unwrap()
            .into_iter()
            .map(|n| n.name)
            .collect();
        assert_eq!(names, vec!["alpha", "alpine"]);
        assert_eq!(Namespace::count(&conn, &visible).unwrap(), 2);
        assert_eq!(Namespace::count(&conn, &[]).unwrap(), 0);
    }
}
