// src/db/models/environment.rs

//! Environment model - a (namespace, name) pair pointing at its current build

use super::{Namespace, Page, arn_clause};
use crate::db;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Environment {
    pub id: Option<i64>,
    pub namespace_id: i64,
    /// Name of the owning namespace (joined, read-only)
    pub namespace: String,
    pub name: String,
    pub specification_id: Option<i64>,
    pub current_build_id: Option<i64>,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Filters accepted by [`Environment::list`]
#[derive(Debug, Clone, Default)]
pub struct EnvironmentFilter {
    pub namespace: Option<String>,
    pub name: Option<String>,
    /// Substring match on namespace or environment name
    pub search: Option<String>,
    /// ARN (namespace glob, environment glob) pairs the caller may see
    pub visible: Vec<(String, String)>,
    /// Cursor: only return environments with a larger id
    pub after_id: Option<i64>,
    pub include_deleted: bool,
}

const SELECT: &str = "SELECT e.id, e.namespace_id, n.name, e.name, e.specification_id,
        e.current_build_id, e.description, e.deleted_at
    FROM environment e JOIN namespace n ON n.id = e.namespace_id";

impl Environment {
    pub fn new(namespace: &Namespace, name: impl Into<String>) -> Result<Self> {
        Ok(Self {
            id: None,
            namespace_id: namespace.id.ok_or_else(|| Error::NotFound("namespace".into()))?,
            namespace: namespace.name.clone(),
            name: name.into(),
            specification_id: None,
            current_build_id: None,
            description: String::new(),
            deleted_at: None,
        })
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO environment (namespace_id, name, description) VALUES (?1, ?2, ?3)",
            params![self.namespace_id, &self.name, &self.description],
        )?;
        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Fetch or create the environment `name` inside `namespace`
    ///
    /// A soft-deleted environment is revived; its builds are kept.
    pub fn ensure(conn: &Connection, namespace: &Namespace, name: &str, description: Option<&str>) -> Result<Self> {
        let namespace_id = namespace.id.ok_or_else(|| Error::NotFound("namespace".into()))?;
        let existing = conn
            .query_row(
                &format!("{SELECT} WHERE e.namespace_id = ?1 AND e.name = ?2"),
                params![namespace_id, name],
                Self::from_row,
            )
            .optional()?;

        match existing {
            Some(mut env) => {
                if env.deleted_at.is_some() {
                    conn.execute(
                        "UPDATE environment SET deleted_at = NULL WHERE id = ?1",
                        [env.id],
                    )?;
                    env.deleted_at = None;
                }
                if let Some(description) = description {
                    env.update_description(conn, description)?;
                }
                Ok(env)
            }
            None => {
                let mut env = Self::new(namespace, name)?;
                env.description = description.unwrap_or_default().to_string();
                env.insert(conn)?;
                Ok(env)
            }
        }
    }

    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let env = conn
            .query_row(&format!("{SELECT} WHERE e.id = ?1"), [id], Self::from_row)
            .optional()?;
        Ok(env)
    }

    /// Find an active environment by namespace and environment name
    pub fn find_by_name(conn: &Connection, namespace: &str, name: &str) -> Result<Option<Self>> {
        let env = conn
            .query_row(
                &format!(
                    "{SELECT} WHERE n.name = ?1 AND e.name = ?2
                       AND e.deleted_at IS NULL AND n.deleted_at IS NULL"
                ),
                [namespace, name],
                Self::from_row,
            )
            .optional()?;
        Ok(env)
    }

    pub fn list(conn: &Connection, filter: &EnvironmentFilter, page: Page) -> Result<Vec<Self>> {
        let (clause, mut params) = Self::filter(filter);
        params.push(Box::new(page.limit));
        params.push(Box::new(page.offset));
        let sql = format!(
            "{SELECT} WHERE {clause} ORDER BY e.id LIMIT ?{} OFFSET ?{}",
            params.len() - 1,
            params.len()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count(conn: &Connection, filter: &EnvironmentFilter) -> Result<i64> {
        let (clause, params) = Self::filter(&EnvironmentFilter {
            after_id: None,
            ..filter.clone()
        });
        let sql = format!(
            "SELECT COUNT(*) FROM environment e JOIN namespace n ON n.id = e.namespace_id WHERE {clause}"
        );
        let count = conn.query_row(&sql, rusqlite::params_from_iter(params.iter()), |row| row.get(0))?;
        Ok(count)
    }

    fn filter(filter: &EnvironmentFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        let mut conditions = Vec::new();
        if !filter.include_deleted {
            conditions.push("e.deleted_at IS NULL AND n.deleted_at IS NULL".to_string());
        }
        if let Some(namespace) = &filter.namespace {
            params.push(Box::new(namespace.clone()));
            conditions.push(format!("n.name = ?{}", params.len()));
        }
        if let Some(name) = &filter.name {
            params.push(Box::new(name.clone()));
            conditions.push(format!("e.name = ?{}", params.len()));
        }
        if let Some(search) = &filter.search {
            params.push(Box::new(format!("%{search}%")));
            conditions.push(format!(
                "(n.name LIKE ?{0} OR e.name LIKE ?{0})",
                params.len()
            ));
        }
        if let Some(after_id) = filter.after_id {
            params.push(Box::new(after_id));
            conditions.push(format!("e.id > ?{}", params.len()));
        }
        conditions.push(
            arn_clause("n.name", Some("e.name"), &filter.visible, &mut params)
                .unwrap_or_else(|| "0".into()),
        );
        (conditions.join(" AND "), params)
    }

    /// Point the environment at `build_id`
    pub fn set_current_build(
        conn: &Connection,
        environment_id: i64,
        build_id: i64,
        specification_id: i64,
    ) -> Result<()> {
        conn.execute(
            "UPDATE environment SET current_build_id = ?1, specification_id = ?2 WHERE id = ?3",
            params![build_id, specification_id, environment_id],
        )?;
        Ok(())
    }

    pub fn update_description(&mut self, conn: &Connection, description: &str) -> Result<()> {
        conn.execute(
            "UPDATE environment SET description = ?1 WHERE id = ?2",
            params![description, self.id],
        )?;
        self.description = description.to_string();
        Ok(())
    }

    pub fn soft_delete(&mut self, conn: &Connection) -> Result<()> {
        let now = db::now();
        conn.execute(
            "UPDATE environment SET deleted_at = ?1 WHERE id = ?2",
            params![now, self.id],
        )?;
        self.deleted_at = Some(now);
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            namespace_id: row.get(1)?,
            namespace: row.get(2)?,
            name: row.get(3)?,
            specification_id: row.get(4)?,
            current_build_id: row.get(5)?,
            description: row.get(6)?,
            deleted_at: row.get(7)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_visible() -> Vec<(String, String)> {
        vec![("*".into(), "*".into())]
    }

    #[test]
    fn test_ensure_is_unique_per_namespace() {
        let conn = db::open_in_memory().unwrap();
        let ns = Namespace::ensure(&conn, "default").unwrap();
        let a = Environment::ensure(&conn, &ns, "test", None).unwrap();
        let b = Environment::ensure(&conn, &ns, "test", Some("desc")).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.description, "desc");

        let other = Namespace::ensure(&conn, "other").unwrap();
        let c = Environment::ensure(&conn, &other, "test", None).unwrap();
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_list_with_cursor_and_visibility() {
        let conn = db::open_in_memory().unwrap();
        let ns = Namespace::ensure(&conn, "default").unwrap();
        let secret = Namespace::ensure(&conn, "secret").unwrap();
        let first = Environment::ensure(&conn, &ns, "one", None).unwrap();
        Environment::ensure(&conn, &ns, "two", None).unwrap();
        Environment::ensure(&conn, &secret, "hidden", None).unwrap();

        let filter = EnvironmentFilter {
            visible: vec![("default".into(), "*".into())],
            after_id: first.id,
            ..Default::default()
        };
        let envs = Environment::list(&conn, &filter, Page::new(1, 10)).unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].name, "two");
        assert_eq!(Environment::count(&conn, &filter).unwrap(), 2);

        let all = EnvironmentFilter {
            visible: all_visible(),
            ..Default::default()
        };
        assert_eq!(Environment::count(&conn, &all).unwrap(), 3);
    }

    #[test]
    fn test_soft_delete_hides_from_lookup() {
        let conn = db::open_in_memory().unwrap();
        let ns = Namespace::ensure(&conn, "default").unwrap();
        let mut env = Environment::ensure(&conn, &ns, "test", None).unwrap();
        env.soft_delete(&conn).unwrap();
        assert!(Environment::find_by_name(&conn, "default", "test").unwrap().is_none());
        assert!(Environment::find_by_id(&conn, env.id.unwrap()).unwrap().is_some());
    }
}
