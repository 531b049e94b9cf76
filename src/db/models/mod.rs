// src/db/models/mod.rs

//! Data models for envstore database entities
//!
//! Each struct mirrors one table and carries the queries that read and write
//! it. State transitions for builds live in `crate::build::state`; the task
//! broker table is owned by `crate::queue::broker`.

mod artifact;
mod build;
mod channel;
mod environment;
mod namespace;
mod package;
mod role_mapping;
mod setting;
mod solve;
mod specification;
mod storage_metrics;
mod worker;

pub use artifact::{ArtifactType, BuildArtifact};
pub use build::{Build, BuildFilter, BuildStatus};
pub use channel::CondaChannel;
pub use environment::{Environment, EnvironmentFilter};
pub use namespace::Namespace;
pub use package::{CondaPackage, CondaPackageBuild, PackageBuildRecord, PackageFilter, PackageRecord};
pub use role_mapping::NamespaceRoleMapping;
pub use setting::KeyValueSetting;
pub use solve::Solve;
pub use specification::Specification;
pub use storage_metrics::StorageMetrics;
pub use worker::WorkerRecord;

use rusqlite::Row;
use rusqlite::types::Type;

/// Offset/limit window applied to list queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: i64,
    pub limit: i64,
}

impl Page {
    pub fn new(page: i64, size: i64) -> Self {
        let size = size.max(1);
        Self {
            offset: (page.max(1) - 1) * size,
            limit: size,
        }
    }

    /// No limit; used internally when every row is needed
    pub fn all() -> Self {
        Self {
            offset: 0,
            limit: -1,
        }
    }
}

/// Read a JSON text column
pub(crate) fn json_column(row: &Row, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a text column holding an enum discriminant
pub(crate) fn enum_column<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let text: String = row.get(idx)?;
    text.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

/// Convert an ARN glob into a LIKE pattern (`*` matches anything)
///
/// LIKE metacharacters in the literal parts are escaped with `\`, so
/// queries using the result must add `ESCAPE '\'`.
pub fn glob_to_like(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len());
    for c in glob.chars() {
        match c {
            '*' => out.push('%'),
            '%' | '_' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Build a `(ns LIKE ? AND env LIKE ?) OR ...` clause for a set of
/// (namespace glob, environment glob) pairs
///
/// Returns `None` when the pattern list is empty so callers can decide
/// whether an empty list means "nothing" or "no restriction".
pub(crate) fn arn_clause(
    ns_column: &str,
    env_column: Option<&str>,
    patterns: &[(String, String)],
    params: &mut Vec<Box<dyn rusqlite::ToSql>>,
) -> Option<String> {
    if patterns.is_empty() {
        return None;
    }
    let mut parts = Vec::with_capacity(patterns.len());
    for (ns, env) in patterns {
        params.push(Box::new(glob_to_like(ns)));
        match env_column {
            Some(env_column) => {
                params.push(Box::new(glob_to_like(env)));
                parts.push(format!(
                    "({ns_column} LIKE ?{} ESCAPE '\\' AND {env_column} LIKE ?{} ESCAPE '\\')",
                    params.len() - 1,
                    params.len()
                ));
            }
            None => parts.push(format!("{ns_column} LIKE ?{} ESCAPE '\\'", params.len())),
        }
    }
    Some(format!("({})", parts.join(" OR ")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_window() {
        assert_eq!(Page::new(1, 10), Page { offset: 0, limit: 10 });
        assert_eq!(Page::new(3, 25), Page { offset: 50, limit: 25 });
        assert_eq!(Page::new(0, 0), Page { offset: 0, limit: 1 });
    }

    #[test]
    fn test_glob_to_like() {
        assert_eq!(glob_to_like("*"), "%");
        assert_eq!(glob_to_like("team_a*"), "team\\_a%");
        assert_eq!(glob_to_like("default"), "default");
    }

    #[test]
    fn test_arn_clause_numbering() {
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(1)];
        let clause = arn_clause(
            "n.name",
            Some("e.name"),
            &[("a".into(), "*".into()), ("b*".into(), "x".into())],
            &mut params,
        )
        .unwrap();
        assert_eq!(params.len(), 5);
        assert!(clause.contains("n.name LIKE ?2"));
        assert!(clause.contains("e.name LIKE ?5"));
        assert!(arn_clause("n.name", None, &[], &mut params).is_none());
    }
}
