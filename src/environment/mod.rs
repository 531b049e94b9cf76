// src/environment/mod.rs

//! Environments and namespaces
//!
//! [`spec`] parses submissions, [`registrar`] turns them into builds. The
//! functions here change environments after the fact: repointing to an
//! older build, editing the description and deleting environments or
//! whole namespaces.

pub mod registrar;
pub mod spec;

pub use registrar::{Registration, register};
pub use spec::Submission;

use crate::build::state;
use crate::db;
use crate::db::models::{Build, BuildStatus, Environment, Namespace};
use crate::error::{Error, Result};
use rusqlite::Connection;
use std::path::Path;
use tracing::info;

fn find_environment(conn: &Connection, namespace: &str, name: &str) -> Result<Environment> {
    Environment::find_by_name(conn, namespace, name)?
        .ok_or_else(|| Error::NotFound(format!("environment {namespace}/{name}")))
}

/// Repoint and/or describe an environment
pub fn update_environment(
    conn: &mut Connection,
    namespace: &str,
    name: &str,
    build_id: Option<i64>,
    description: Option<&str>,
) -> Result<Environment> {
    let environment = find_environment(conn, namespace, name)?;
    let environment_id = environment
        .id
        .ok_or_else(|| Error::NotFound(format!("environment {namespace}/{name}")))?;

    if let Some(build_id) = build_id {
        state::set_current_build(conn, environment_id, build_id)?;
    }
    if let Some(description) = description {
        let mut environment = find_environment(conn, namespace, name)?;
        environment.update_description(conn, description)?;
    }
    find_environment(conn, namespace, name)
}

/// Soft-delete an environment and retire its builds
///
/// Finished builds are deleted (their artifacts are cleaned up by a task);
/// queued and running builds are cancelled. Either all of it happens or
/// none of it does.
pub fn delete_environment(conn: &mut Connection, namespace: &str, name: &str) -> Result<Environment> {
    let environment = db::immediate(conn, |tx| retire_environment(tx, namespace, name))?;
    info!("Deleted environment {}/{}", namespace, name);
    Ok(environment)
}

fn retire_environment(tx: &Connection, namespace: &str, name: &str) -> Result<Environment> {
    let mut environment = find_environment(tx, namespace, name)?;
    let environment_id = environment
        .id
        .ok_or_else(|| Error::NotFound(format!("environment {namespace}/{name}")))?;

    tx.execute(
        "UPDATE environment SET current_build_id = NULL WHERE id = ?1",
        [environment_id],
    )?;
    for build in Build::find_by_environment(tx, environment_id)? {
        let build_id = build.id.unwrap_or_default();
        match build.status {
            BuildStatus::Completed | BuildStatus::Failed => state::delete_in(tx, build_id)?,
            BuildStatus::Queued | BuildStatus::Building => state::request_cancel_in(tx, build_id)?,
            _ => {}
        }
    }
    environment.soft_delete(tx)?;
    Ok(environment)
}

/// Soft-delete a namespace with all of its environments
pub fn delete_namespace(conn: &mut Connection, name: &str) -> Result<Vec<Environment>> {
    let deleted = db::immediate(conn, |tx| {
        let mut namespace = Namespace::find_by_name(tx, name)?
            .ok_or_else(|| Error::NotFound(format!("namespace {name}")))?;
        let environments: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT name FROM environment WHERE namespace_id = ?1 AND deleted_at IS NULL",
            )?;
            stmt.query_map([namespace.id], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?
        };

        let mut deleted = Vec::with_capacity(environments.len());
        for environment in environments {
            deleted.push(retire_environment(tx, name, &environment)?);
        }
        tx.execute(
            "DELETE FROM namespace_role_mapping WHERE namespace_id = ?1",
            [namespace.id],
        )?;
        namespace.soft_delete(tx)?;
        Ok(deleted)
    })?;
    info!("Deleted namespace {} with {} environments", name, deleted.len());
    Ok(deleted)
}

/// Remove an environment's symlink, leaving anything else in place
pub fn remove_environment_link(store_directory: &Path, environment: &Environment) -> Result<()> {
    let link = crate::build::key::environment_path(store_directory, &environment.namespace, &environment.name);
    match std::fs::symlink_metadata(&link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            std::fs::remove_file(&link)?;
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::queue::Task;
    use crate::settings::Settings;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Connection, i64) {
        let temp = TempDir::new().unwrap();
        let mut conn = db::open_in_memory().unwrap();
        let defaults = Settings {
            storage_threshold: 0,
            ..Settings::default()
        };
        let submission =
            Submission::from_value(json!({"name": "test", "channels": ["main"], "dependencies": ["zlib"]}))
                .unwrap();
        let build_id = register(
            &mut conn,
            &defaults,
            temp.path(),
            Registration::new(Some("default".into()), submission),
        )
        .unwrap()
        .unwrap();
        (temp, conn, build_id)
    }

    #[test]
    fn test_update_description_and_repoint() {
        let (_temp, mut conn, build_id) = setup();
        state::start(&mut conn, build_id).unwrap();
        state::complete(&mut conn, build_id, "/store/default/test").unwrap();

        let env = update_environment(&mut conn, "default", "test", Some(build_id), Some("demo")).unwrap();
        assert_eq!(env.description, "demo");
        assert_eq!(env.current_build_id, Some(build_id));
        assert!(Task::find_by_id(&conn, &format!("build-{build_id}-symlink")).unwrap().is_some());

        let missing = update_environment(&mut conn, "default", "nope", None, Some("x"));
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_delete_environment_retires_builds() {
        let (_temp, mut conn, build_id) = setup();
        state::start(&mut conn, build_id).unwrap();
        state::complete(&mut conn, build_id, "/store/default/test").unwrap();

        delete_environment(&mut conn, "default", "test").unwrap();
        assert_eq!(Build::get(&conn, build_id).unwrap().status, BuildStatus::Deleted);
        assert!(Environment::find_by_name(&conn, "default", "test").unwrap().is_none());
    }

    #[test]
    fn test_failed_delete_leaves_environment_untouched() {
        let (_temp, mut conn, build_id) = setup();
        state::start(&mut conn, build_id).unwrap();
        state::complete(&mut conn, build_id, "/store/default/test").unwrap();
        conn.execute_batch(
            "CREATE TRIGGER refuse_soft_delete BEFORE UPDATE OF deleted_at ON environment
             BEGIN SELECT RAISE(ABORT, 'refused'); END;",
        )
        .unwrap();

        assert!(delete_environment(&mut conn, "default", "test").is_err());

        let env = Environment::find_by_name(&conn, "default", "test").unwrap().unwrap();
        assert_eq!(env.current_build_id, Some(build_id));
        assert_eq!(Build::get(&conn, build_id).unwrap().status, BuildStatus::Completed);
        assert!(Task::find_by_id(&conn, &format!("build-{build_id}-delete")).unwrap().is_none());
    }

    #[test]
    fn test_delete_namespace_cancels_queued_builds() {
        let (_temp, mut conn, build_id) = setup();
        let deleted = delete_namespace(&mut conn, "default").unwrap();
        assert_eq!(deleted.len(), 1);
        assert!(Task::is_chain_revoked(&conn, &format!("build-{build_id}")).unwrap());
        assert!(Namespace::find_by_name(&conn, "default").unwrap().is_none());
    }
}
