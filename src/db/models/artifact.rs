// src/db/models/artifact.rs

//! Build artifact model - binds a build to a blob-store key

use super::enum_column;
use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactType {
    /// On-disk prefix; the key is the absolute path
    Directory,
    Lockfile,
    Logs,
    Yaml,
    CondaPack,
    ContainerManifest,
    ContainerBlob,
    ContainerRegistry,
    Installer,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Directory => "DIRECTORY",
            ArtifactType::Lockfile => "LOCKFILE",
            ArtifactType::Logs => "LOGS",
            ArtifactType::Yaml => "YAML",
            ArtifactType::CondaPack => "CONDA_PACK",
            ArtifactType::ContainerManifest => "CONTAINER_MANIFEST",
            ArtifactType::ContainerBlob => "CONTAINER_BLOB",
            ArtifactType::ContainerRegistry => "CONTAINER_REGISTRY",
            ArtifactType::Installer => "INSTALLER",
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "DIRECTORY" => Ok(ArtifactType::Directory),
            "LOCKFILE" => Ok(ArtifactType::Lockfile),
            "LOGS" => Ok(ArtifactType::Logs),
            "YAML" => Ok(ArtifactType::Yaml),
            "CONDA_PACK" => Ok(ArtifactType::CondaPack),
            "CONTAINER_MANIFEST" => Ok(ArtifactType::ContainerManifest),
            "CONTAINER_BLOB" => Ok(ArtifactType::ContainerBlob),
            "CONTAINER_REGISTRY" => Ok(ArtifactType::ContainerRegistry),
            "INSTALLER" => Ok(ArtifactType::Installer),
            _ => Err(format!("Invalid artifact type: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildArtifact {
    pub id: Option<i64>,
    pub build_id: i64,
    pub artifact_type: ArtifactType,
    pub key: String,
}

impl BuildArtifact {
    pub fn new(build_id: i64, artifact_type: ArtifactType, key: impl Into<String>) -> Self {
        Self {
            id: None,
            build_id,
            artifact_type,
            key: key.into(),
        }
    }

    /// Insert unless the same (build, type, key) row exists
    ///
    /// Returns whether a new row was written.
    pub fn insert_or_ignore(&mut self, conn: &Connection) -> Result<bool> {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO build_artifact (build_id, artifact_type, key) VALUES (?1, ?2, ?3)",
            params![self.build_id, self.artifact_type.as_str(), &self.key],
        )?;
        self.id = conn
            .query_row(
                "SELECT id FROM build_artifact WHERE build_id = ?1 AND artifact_type = ?2 AND key = ?3",
                params![self.build_id, self.artifact_type.as_str(), &self.key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(inserted > 0)
    }

    pub fn find_by_build(conn: &Connection, build_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, build_id, artifact_type, key FROM build_artifact WHERE build_id = ?1 ORDER BY id",
        )?;
        let artifacts = stmt
            .query_map([build_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(artifacts)
    }

    /// First artifact of the given type for a build
    pub fn find(conn: &Connection, build_id: i64, artifact_type: ArtifactType) -> Result<Option<Self>> {
        let artifact = conn
            .query_row(
                "SELECT id, build_id, artifact_type, key FROM build_artifact
                 WHERE build_id = ?1 AND artifact_type = ?2 ORDER BY id LIMIT 1",
                params![build_id, artifact_type.as_str()],
                Self::from_row,
            )
            .optional()?;
        Ok(artifact)
    }

    /// Whether any build has a row for `key`
    pub fn key_exists(conn: &Connection, key: &str) -> Result<bool> {
        Ok(conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM build_artifact WHERE key = ?1)",
            [key],
            |row| row.get(0),
        )?)
    }

    pub fn delete(conn: &Connection, build_id: i64, key: &str) -> Result<usize> {
        Ok(conn.execute(
            "DELETE FROM build_artifact WHERE build_id = ?1 AND key = ?2",
            params![build_id, key],
        )?)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            build_id: row.get(1)?,
            artifact_type: enum_column(row, 2)?,
            key: row.get(3)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_type_parse() {
        assert_eq!("CONDA_PACK".parse::<ArtifactType>().unwrap(), ArtifactType::CondaPack);
        assert!("TARBALL".parse::<ArtifactType>().is_err());
        let json = serde_json::to_string(&ArtifactType::CondaPack).unwrap();
        assert_eq!(json, "\"CONDA_PACK\"");
    }
}
