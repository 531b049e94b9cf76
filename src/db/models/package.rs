// src/db/models/package.rs

//! Conda package catalog
//!
//! `CondaPackage` aggregates every build of one (channel, name, version);
//! `CondaPackageBuild` is the fetchable unit linked to builds and solves.

use super::Page;
use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct CondaPackage {
    pub id: Option<i64>,
    pub channel_id: i64,
    pub name: String,
    pub version: String,
    pub license: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
}

impl CondaPackage {
    pub fn new(channel_id: i64, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: None,
            channel_id,
            name: name.into(),
            version: version.into(),
            license: None,
            summary: None,
            description: None,
        }
    }

    /// Insert unless (channel, name, version) exists; returns the row id either way
    pub fn ensure(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO conda_package (channel_id, name, version, license, summary, description)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(channel_id, name, version) DO NOTHING",
            params![
                self.channel_id,
                &self.name,
                &self.version,
                &self.license,
                &self.summary,
                &self.description,
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM conda_package WHERE channel_id = ?1 AND name = ?2 AND version = ?3",
            params![self.channel_id, &self.name, &self.version],
            |row| row.get(0),
        )?;
        self.id = Some(id);
        Ok(id)
    }

    pub fn find(conn: &Connection, channel_id: i64, name: &str, version: &str) -> Result<Option<Self>> {
        let package = conn
            .query_row(
                "SELECT id, channel_id, name, version, license, summary, description
                 FROM conda_package WHERE channel_id = ?1 AND name = ?2 AND version = ?3",
                params![channel_id, name, version],
                Self::from_row,
            )
            .optional()?;
        Ok(package)
    }

    /// Paginated catalog listing with optional search, sorting and de-duplication
    pub fn list(conn: &Connection, filter: &PackageFilter, page: Page) -> Result<Vec<PackageRecord>> {
        let (clause, mut params) = filter.clause();
        let group = filter.group_by()?;
        let order = filter.order_by()?;
        params.push(Box::new(page.limit));
        params.push(Box::new(page.offset));
        let sql = format!(
            "SELECT MIN(p.id), c.name, p.name, p.version, p.license, p.summary
             FROM conda_package p JOIN conda_channel c ON c.id = p.channel_id
             WHERE {clause} GROUP BY {group} ORDER BY {order} LIMIT ?{} OFFSET ?{}",
            params.len() - 1,
            params.len()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), PackageRecord::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count(conn: &Connection, filter: &PackageFilter) -> Result<i64> {
        let (clause, params) = filter.clause();
        let group = filter.group_by()?;
        let sql = format!(
            "SELECT COUNT(*) FROM (
                SELECT 1 FROM conda_package p JOIN conda_channel c ON c.id = p.channel_id
                WHERE {clause} GROUP BY {group})"
        );
        Ok(conn.query_row(&sql, rusqlite::params_from_iter(params.iter()), |row| row.get(0))?)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            channel_id: row.get(1)?,
            name: row.get(2)?,
            version: row.get(3)?,
            license: row.get(4)?,
            summary: row.get(5)?,
            description: row.get(6)?,
        })
    }
}

/// Query options for the package catalog
#[derive(Debug, Clone, Default)]
pub struct PackageFilter {
    /// Substring match on the package name
    pub search: Option<String>,
    /// Exact package name
    pub exact: Option<String>,
    /// Only packages having a build with this build string
    pub build: Option<String>,
    /// Any of `name`, `version`, `channel`
    pub sort_by: Vec<String>,
    /// Any of `name`, `version`, `channel`; one row per distinct combination
    pub distinct_on: Vec<String>,
}

impl PackageFilter {
    fn column(field: &str) -> Result<&'static str> {
        match field {
            "name" => Ok("p.name"),
            "version" => Ok("p.version"),
            "channel" => Ok("c.name"),
            other => Err(Error::Validation(format!(
                "invalid field {other}; expected one of name, version, channel"
            ))),
        }
    }

    fn clause(&self) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        let mut conditions = vec!["1".to_string()];
        if let Some(search) = &self.search {
            params.push(Box::new(format!("%{search}%")));
            conditions.push(format!("p.name LIKE ?{}", params.len()));
        }
        if let Some(exact) = &self.exact {
            params.push(Box::new(exact.clone()));
            conditions.push(format!("p.name = ?{}", params.len()));
        }
        if let Some(build) = &self.build {
            params.push(Box::new(build.clone()));
            conditions.push(format!(
                "EXISTS (SELECT 1 FROM conda_package_build pb WHERE pb.package_id = p.id AND pb.build = ?{})",
                params.len()
            ));
        }
        (conditions.join(" AND "), params)
    }

    fn group_by(&self) -> Result<String> {
        if self.distinct_on.is_empty() {
            return Ok("p.id".into());
        }
        let columns = self
            .distinct_on
            .iter()
            .map(|f| Self::column(f))
            .collect::<Result<Vec<_>>>()?;
        Ok(columns.join(", "))
    }

    fn order_by(&self) -> Result<String> {
        let mut columns = self
            .sort_by
            .iter()
            .map(|f| Self::column(f))
            .collect::<Result<Vec<_>>>()?;
        columns.push("MIN(p.id)");
        Ok(columns.join(", "))
    }
}

/// Catalog row as returned by the API
#[derive(Debug, Clone, Serialize)]
pub struct PackageRecord {
    pub id: i64,
    pub channel: String,
    pub name: String,
    pub version: String,
    pub license: Option<String>,
    pub summary: Option<String>,
}

impl PackageRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            channel: row.get(1)?,
            name: row.get(2)?,
            version: row.get(3)?,
            license: row.get(4)?,
            summary: row.get(5)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CondaPackageBuild {
    pub id: Option<i64>,
    pub package_id: i64,
    pub build: String,
    pub build_number: i64,
    pub subdir: Option<String>,
    pub sha256: String,
    pub md5: String,
    pub size: i64,
    /// JSON list text, or the empty string for no entries
    pub depends: String,
    pub constrains: String,
    pub timestamp: Option<i64>,
}

/// Package build joined with its package and channel, for build listings
#[derive(Debug, Clone, Serialize)]
pub struct PackageBuildRecord {
    pub id: i64,
    pub channel: String,
    pub name: String,
    pub version: String,
    pub build: String,
    pub build_number: i64,
    pub subdir: Option<String>,
    pub sha256: String,
}

impl CondaPackageBuild {
    /// Encoding of `depends` and `constrains`
    pub fn encode_list(items: &[String]) -> String {
        if items.is_empty() {
            String::new()
        } else {
            serde_json::to_string(items).unwrap_or_default()
        }
    }

    /// Insert unless the unique (package, subdir, build, build_number, sha256) exists
    pub fn ensure(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO conda_package_build
                (package_id, build, build_number, subdir, sha256, md5, size, depends, constrains, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(package_id, subdir, build, build_number, sha256) DO NOTHING",
            params![
                self.package_id,
                &self.build,
                self.build_number,
                &self.subdir,
                &self.sha256,
                &self.md5,
                self.size,
                &self.depends,
                &self.constrains,
                self.timestamp,
            ],
        )?;
        // NULL subdir never conflicts, so look the row up by sha256 within the package
        let id = conn.query_row(
            "SELECT id FROM conda_package_build
             WHERE package_id = ?1 AND sha256 = ?2 AND build = ?3 AND build_number = ?4
               AND subdir IS ?5
             ORDER BY id LIMIT 1",
            params![self.package_id, &self.sha256, &self.build, self.build_number, &self.subdir],
            |row| row.get(0),
        )?;
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_sha256(conn: &Connection, sha256: &str) -> Result<Option<Self>> {
        let build = conn
            .query_row(
                "SELECT id, package_id, build, build_number, subdir, sha256, md5, size,
                        depends, constrains, timestamp
                 FROM conda_package_build WHERE sha256 = ?1 ORDER BY id LIMIT 1",
                [sha256],
                Self::from_row,
            )
            .optional()?;
        Ok(build)
    }

    /// Package builds linked to a build
    pub fn list_for_build(conn: &Connection, build_id: i64, page: Page) -> Result<Vec<PackageBuildRecord>> {
        Self::list_linked(conn, "build_conda_package_build", "build_id", build_id, page)
    }

    pub fn count_for_build(conn: &Connection, build_id: i64) -> Result<i64> {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM build_conda_package_build WHERE build_id = ?1",
            [build_id],
            |row| row.get(0),
        )?)
    }

    /// Package builds linked to a solve
    pub fn list_for_solve(conn: &Connection, solve_id: i64) -> Result<Vec<PackageBuildRecord>> {
        Self::list_linked(conn, "solve_conda_package_build", "solve_id", solve_id, Page::all())
    }

    fn list_linked(
        conn: &Connection,
        table: &str,
        column: &str,
        owner_id: i64,
        page: Page,
    ) -> Result<Vec<PackageBuildRecord>> {
        let sql = format!(
            "SELECT pb.id, c.name, p.name, p.version, pb.build, pb.build_number, pb.subdir, pb.sha256
             FROM {table} link
             JOIN conda_package_build pb ON pb.id = link.conda_package_build_id
             JOIN conda_package p ON p.id = pb.package_id
             JOIN conda_channel c ON c.id = p.channel_id
             WHERE link.{column} = ?1
             ORDER BY p.name, pb.id LIMIT ?2 OFFSET ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![owner_id, page.limit, page.offset], |row| {
                Ok(PackageBuildRecord {
                    id: row.get(0)?,
                    channel: row.get(1)?,
                    name: row.get(2)?,
                    version: row.get(3)?,
                    build: row.get(4)?,
                    build_number: row.get(5)?,
                    subdir: row.get(6)?,
                    sha256: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            package_id: row.get(1)?,
            build: row.get(2)?,
            build_number: row.get(3)?,
            subdir: row.get(4)?,
            sha256: row.get(5)?,
            md5: row.get(6)?,
            size: row.get(7)?,
            depends: row.get(8)?,
            constrains: row.get(9)?,
            timestamp: row.get(10)?,
        })
    }
}
