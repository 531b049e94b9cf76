// src/db/models/role_mapping.rs

//! Namespace-to-namespace role grants
//!
//! A mapping on namespace `N` with `other_namespace = M` and `role = R`
//! grants `R` on every environment of `N` to callers whose primary
//! namespace matches `M` (a glob).

use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceRoleMapping {
    pub id: Option<i64>,
    pub namespace_id: i64,
    /// Namespace name (joined, read-only)
    pub namespace: String,
    pub other_namespace: String,
    pub role: String,
}

const SELECT: &str = "SELECT m.id, m.namespace_id, n.name, m.other_namespace, m.role
    FROM namespace_role_mapping m JOIN namespace n ON n.id = m.namespace_id";

impl NamespaceRoleMapping {
    pub fn list_for_namespace(conn: &Connection, namespace_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "{SELECT} WHERE m.namespace_id = ?1 ORDER BY m.other_namespace"
        ))?;
        let rows = stmt
            .query_map([namespace_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn find(conn: &Connection, namespace_id: i64, other_namespace: &str) -> Result<Option<Self>> {
        let row = conn
            .query_row(
                &format!("{SELECT} WHERE m.namespace_id = ?1 AND m.other_namespace = ?2"),
                params![namespace_id, other_namespace],
                Self::from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Create a mapping; an existing mapping for the same pair is a conflict
    pub fn create(conn: &Connection, namespace_id: i64, other_namespace: &str, role: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO namespace_role_mapping (namespace_id, other_namespace, role)
             VALUES (?1, ?2, ?3)",
            params![namespace_id, other_namespace, role],
        )
        .map_err(|e| {
            let err = Error::from(e);
            if err.is_unique_violation() {
                Error::Conflict(format!("role mapping for {other_namespace} already exists"))
            } else {
                err
            }
        })?;
        Ok(())
    }

    pub fn update(conn: &Connection, namespace_id: i64, other_namespace: &str, role: &str) -> Result<()> {
        let updated = conn.execute(
            "UPDATE namespace_role_mapping SET role = ?1
             WHERE namespace_id = ?2 AND other_namespace = ?3",
            params![role, namespace_id, other_namespace],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("role mapping for {other_namespace}")));
        }
        Ok(())
    }

    pub fn delete(conn: &Connection, namespace_id: i64, other_namespace: &str) -> Result<()> {
        let deleted = conn.execute(
            "DELETE FROM namespace_role_mapping WHERE namespace_id = ?1 AND other_namespace = ?2",
            params![namespace_id, other_namespace],
        )?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("role mapping for {other_namespace}")));
        }
        Ok(())
    }

    /// Every mapping across active namespaces (used to expand a caller's bindings)
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!("{SELECT} WHERE n.deleted_at IS NULL ORDER BY m.id"))?;
        let rows = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            namespace_id: row.get(1)?,
            namespace: row.get(2)?,
            other_namespace: row.get(3)?,
            role: row.get(4)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::db::models::Namespace;

    #[test]
    fn test_mapping_crud() {
        let conn = db::open_in_memory().unwrap();
        let ns = Namespace::ensure(&conn, "data").unwrap();
        let id = ns.id.unwrap();

        NamespaceRoleMapping::create(&conn, id, "analysts", "viewer").unwrap();
        assert!(matches!(
            NamespaceRoleMapping::create(&conn, id, "analysts", "admin"),
            Err(Error::Conflict(_))
        ));
        NamespaceRoleMapping::update(&conn, id, "analysts", "developer").unwrap();
        let found = NamespaceRoleMapping::find(&conn, id, "analysts").unwrap().unwrap();
        assert_eq!(found.role, "developer");
        assert_eq!(found.namespace, "data");

        NamespaceRoleMapping::delete(&conn, id, "analysts").unwrap();
        assert!(NamespaceRoleMapping::list_for_namespace(&conn, id).unwrap().is_empty());
        assert!(matches!(
            NamespaceRoleMapping::delete(&conn, id, "analysts"),
            Err(Error::NotFound(_))
        ));
    }
}
