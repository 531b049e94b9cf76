// src/environment/registrar.rs

//! Environment registration
//!
//! Turns a submitted specification into a queued build: settings for the
//! target scope are applied (default channels and packages, allowed
//! channels, included and required packages), free space is checked, the
//! specification is stored by content hash and a build plus its task chain
//! are created in one transaction.

use super::spec::{Submission, conda_package_name, normalize_channel, pip_package_name, validate_name};
use crate::db;
use crate::db::models::{Build, Environment, Namespace, Solve, Specification};
use crate::error::{Error, Result};
use crate::queue::{self, Task, TaskKind};
use crate::settings::{Settings, get_settings};
use crate::storage::disk_space;
use rusqlite::Connection;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

/// A request to build a specification into an environment
#[derive(Debug, Clone)]
pub struct Registration {
    /// Target namespace; the `default_namespace` setting when absent
    pub namespace: Option<String>,
    pub submission: Submission,
    /// Build even when the same specification already has a live build
    pub force: bool,
    /// Enforce `storage_threshold` against free space
    pub check_storage: bool,
}

impl Registration {
    pub fn new(namespace: Option<String>, submission: Submission) -> Self {
        Self {
            namespace,
            submission,
            force: false,
            check_storage: true,
        }
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// Register `request`; returns the new build id, or `None` when an
/// identical specification is already built in the namespace
pub fn register(
    conn: &mut Connection,
    defaults: &Settings,
    store_directory: &Path,
    request: Registration,
) -> Result<Option<i64>> {
    let namespace = match request.namespace {
        Some(ns) => ns,
        None => get_settings(conn, defaults, None, None)?.default_namespace,
    };
    validate_name("namespace", &namespace)?;
    let name = request.submission.name().to_string();
    let settings = get_settings(conn, defaults, Some(&namespace), Some(&name))?;

    let submission = prepare(request.submission, &settings)?;
    if request.check_storage {
        check_free_space(store_directory, settings.storage_threshold)?;
    }

    let sha256 = submission.sha256()?;
    let value = submission.to_value()?;
    let is_lockfile = submission.is_lockfile();
    let description = submission.description().map(str::to_string);
    let force = request.force;

    db::immediate(conn, |tx| {
        let specification = Specification::new(name.clone(), value, sha256, is_lockfile).insert_or_get(tx)?;
        let specification_id = specification
            .id
            .ok_or_else(|| Error::NotFound("specification".into()))?;
        let ns = Namespace::ensure(tx, &namespace)?;
        let namespace_id = ns.id.ok_or_else(|| Error::NotFound(format!("namespace {namespace}")))?;

        if !force && Build::exists_for_specification(tx, specification_id, namespace_id)? {
            info!(
                "Specification {} already built in {}, not scheduling",
                specification.sha256, namespace
            );
            return Ok(None);
        }

        let environment = Environment::ensure(tx, &ns, &name, description.as_deref())?;
        let environment_id = environment
            .id
            .ok_or_else(|| Error::NotFound(format!("environment {namespace}/{name}")))?;
        let build_id = Build::new(specification_id, environment_id, settings.build_key_version).insert(tx)?;
        queue::enqueue_build(tx, build_id, settings.conda_max_solve_time)?;
        info!("Registered {}/{} as build {}", namespace, name, build_id);
        Ok(Some(build_id))
    })
}

/// Apply scope settings to a submission
///
/// Lockfile submissions are pinned already and pass through unchanged.
pub fn prepare(submission: Submission, settings: &Settings) -> Result<Submission> {
    let mut spec = match submission {
        Submission::Conda(spec) => spec,
        lockfile @ Submission::Lockfile(_) => return Ok(lockfile),
    };

    if spec.channels.is_empty() {
        spec.channels = settings.conda_default_channels.clone();
    }
    if spec.dependencies.is_empty() {
        for package in &settings.conda_default_packages {
            spec.add_conda(package);
        }
        for package in &settings.pypi_default_packages {
            spec.add_pip(package);
        }
    }

    if !settings.conda_allowed_channels.is_empty() {
        let alias = &settings.conda_channel_alias;
        let allowed: BTreeSet<String> = settings
            .conda_allowed_channels
            .iter()
            .map(|c| normalize_channel(c, alias))
            .collect();
        let denied: Vec<&str> = spec
            .channels
            .iter()
            .filter(|c| !allowed.contains(&normalize_channel(c, alias)))
            .map(String::as_str)
            .collect();
        if !denied.is_empty() {
            return Err(Error::Validation(format!(
                "conda channel(s) {} not allowed; allowed channels: {}",
                denied.join(", "),
                settings.conda_allowed_channels.join(", ")
            )));
        }
    }

    let conda_names: BTreeSet<String> = spec.conda_package_names().into_iter().collect();
    for package in &settings.conda_included_packages {
        if !conda_names.contains(&conda_package_name(package)) {
            debug!("Including conda package {}", package);
            spec.add_conda(package);
        }
    }
    let pip_names: BTreeSet<String> = spec.pip_package_names().into_iter().collect();
    for package in &settings.pypi_included_packages {
        if !pip_names.contains(&pip_package_name(package)) {
            debug!("Including pypi package {}", package);
            spec.add_pip(package);
        }
    }

    let conda_names: BTreeSet<String> = spec.conda_package_names().into_iter().collect();
    let pip_names: BTreeSet<String> = spec.pip_package_names().into_iter().collect();
    let missing_conda: Vec<&str> = settings
        .conda_required_packages
        .iter()
        .filter(|p| !conda_names.contains(&conda_package_name(p)))
        .map(String::as_str)
        .collect();
    let missing_pip: Vec<&str> = settings
        .pypi_required_packages
        .iter()
        .filter(|p| !pip_names.contains(&pip_package_name(p)))
        .map(String::as_str)
        .collect();
    if !missing_conda.is_empty() || !missing_pip.is_empty() {
        let mut parts = Vec::new();
        if !missing_conda.is_empty() {
            parts.push(format!("conda packages {}", missing_conda.join(", ")));
        }
        if !missing_pip.is_empty() {
            parts.push(format!("pypi packages {}", missing_pip.join(", ")));
        }
        return Err(Error::Validation(format!(
            "specification is missing required {}",
            parts.join(" and ")
        )));
    }

    Ok(Submission::Conda(spec))
}

/// Reject when the store's filesystem has less than `threshold` bytes free
pub fn check_free_space(store_directory: &Path, threshold: u64) -> Result<()> {
    if threshold == 0 {
        return Ok(());
    }
    let probe = store_directory
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or(store_directory);
    let (free, _) = disk_space(probe)?;
    if free < threshold {
        return Err(Error::Storage(format!(
            "insufficient free storage: {free} bytes available, {threshold} required"
        )));
    }
    Ok(())
}

/// Schedule a new build of an existing build's specification
pub fn rebuild(conn: &mut Connection, defaults: &Settings, build_id: i64) -> Result<i64> {
    let build = Build::get(conn, build_id)?;
    let environment = Environment::find_by_id(conn, build.environment_id)?
        .ok_or_else(|| Error::NotFound(format!("environment {}", build.environment_id)))?;
    let settings = get_settings(conn, defaults, Some(&environment.namespace), Some(&environment.name))?;

    db::immediate(conn, |tx| {
        let new_id = Build::new(build.specification_id, build.environment_id, settings.build_key_version)
            .insert(tx)?;
        queue::enqueue_build(tx, new_id, settings.conda_max_solve_time)?;
        info!("Rebuilding build {} as {}", build_id, new_id);
        Ok(new_id)
    })
}

pub fn solve_task_id(solve_id: i64) -> String {
    format!("solve-{solve_id}")
}

/// Store the specification and queue a dry-run solve of it
pub fn solve_specification(conn: &mut Connection, defaults: &Settings, submission: Submission) -> Result<i64> {
    let settings = get_settings(conn, defaults, None, None)?;
    let submission = prepare(submission, &settings)?;
    let sha256 = submission.sha256()?;
    let value = submission.to_value()?;
    let name = submission.name().to_string();
    let is_lockfile = submission.is_lockfile();

    db::immediate(conn, |tx| {
        let specification = Specification::new(name, value, sha256, is_lockfile).insert_or_get(tx)?;
        let specification_id = specification
            .id
            .ok_or_else(|| Error::NotFound("specification".into()))?;
        let solve_id = Solve::new(specification_id).insert(tx)?;
        Task::new(solve_task_id(solve_id), TaskKind::Solve, json!({ "solve_id": solve_id }))
            .with_time_limit(settings.conda_max_solve_time)
            .enqueue(tx)?;
        Ok(solve_id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::BuildStatus;
    use crate::environment::spec::Dependency;
    use tempfile::TempDir;

    fn submission(name: &str, dependencies: &[&str]) -> Submission {
        let deps: Vec<&str> = dependencies.to_vec();
        Submission::from_value(json!({"name": name, "channels": ["main"], "dependencies": deps})).unwrap()
    }

    fn defaults() -> Settings {
        Settings {
            storage_threshold: 0,
            ..Settings::default()
        }
    }

    fn request(namespace: &str, submission: Submission) -> Registration {
        Registration::new(Some(namespace.to_string()), submission)
    }

    #[test]
    fn test_dedupe_within_namespace() {
        let temp = TempDir::new().unwrap();
        let mut conn = db::open_in_memory().unwrap();
        let spec = submission("test", &["zlib"]);

        let first = register(&mut conn, &defaults(), temp.path(), request("default", spec.clone())).unwrap();
        assert_eq!(first, Some(1));
        let second = register(&mut conn, &defaults(), temp.path(), request("default", spec.clone())).unwrap();
        assert_eq!(second, None);

        let forced = register(&mut conn, &defaults(), temp.path(), request("default", spec.clone()).force(true))
            .unwrap();
        assert_eq!(forced, Some(2));

        let other = register(&mut conn, &defaults(), temp.path(), request("other", spec)).unwrap();
        assert_eq!(other, Some(3));
        assert!(Task::find_by_id(&conn, "build-3-environment").unwrap().is_some());
    }

    #[test]
    fn test_failed_build_does_not_block_resubmission() {
        let temp = TempDir::new().unwrap();
        let mut conn = db::open_in_memory().unwrap();
        let spec = submission("test", &["zlib"]);
        let id = register(&mut conn, &defaults(), temp.path(), request("default", spec.clone()))
            .unwrap()
            .unwrap();
        crate::build::state::start(&mut conn, id).unwrap();
        crate::build::state::fail(&conn, id, None).unwrap();
        assert_eq!(Build::get(&conn, id).unwrap().status, BuildStatus::Failed);

        let again = register(&mut conn, &defaults(), temp.path(), request("default", spec)).unwrap();
        assert!(again.is_some());
    }

    #[test]
    fn test_required_packages_are_enumerated() {
        let settings = Settings {
            conda_required_packages: vec!["flask".into(), "numpy".into()],
            ..defaults()
        };
        let err = prepare(submission("test", &["python"]), &settings).unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, Error::Validation(_)));
        assert!(message.contains("flask"));
        assert!(message.contains("numpy"));

        assert!(prepare(submission("test", &["python", "flask>=2", "numpy"]), &settings).is_ok());
    }

    #[test]
    fn test_included_packages_satisfy_requirements() {
        let settings = Settings {
            conda_included_packages: vec!["ipykernel".into()],
            conda_required_packages: vec!["ipykernel".into()],
            pypi_included_packages: vec!["black".into()],
            ..defaults()
        };
        let Submission::Conda(spec) = prepare(submission("test", &["python"]), &settings).unwrap() else {
            panic!("expected a conda specification");
        };
        assert_eq!(spec.conda_package_names(), vec!["python", "ipykernel"]);
        assert_eq!(spec.pip_package_names(), vec!["black"]);
    }

    #[test]
    fn test_allowed_channels() {
        let settings = Settings {
            conda_allowed_channels: vec!["main".into(), "https://conda.anaconda.org/conda-forge".into()],
            ..defaults()
        };
        assert!(prepare(submission("test", &["zlib"]), &settings).is_ok());

        let denied = Submission::from_value(json!({"name": "t", "channels": ["bioconda"], "dependencies": ["x"]}))
            .unwrap();
        let err = prepare(denied, &settings).unwrap_err();
        assert!(err.to_string().contains("bioconda"));
    }

    #[test]
    fn test_defaults_fill_empty_specification() {
        let settings = Settings {
            conda_default_channels: vec!["conda-forge".into()],
            conda_default_packages: vec!["python".into()],
            pypi_default_packages: vec!["requests".into()],
            ..defaults()
        };
        let bare = Submission::from_value(json!({"name": "bare"})).unwrap();
        let Submission::Conda(spec) = prepare(bare, &settings).unwrap() else {
            panic!("expected a conda specification");
        };
        assert_eq!(spec.channels, vec!["conda-forge"]);
        assert_eq!(spec.dependencies.len(), 2);
        assert!(matches!(&spec.dependencies[1], Dependency::Pip { pip } if pip == &vec!["requests".to_string()]));
    }

    #[test]
    fn test_storage_threshold() {
        let temp = TempDir::new().unwrap();
        assert!(check_free_space(temp.path(), 1).is_ok());
        let err = check_free_space(&temp.path().join("not/yet"), u64::MAX).unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[test]
    fn test_rebuild_and_solve() {
        let temp = TempDir::new().unwrap();
        let mut conn = db::open_in_memory().unwrap();
        let id = register(&mut conn, &defaults(), temp.path(), request("default", submission("test", &["zlib"])))
            .unwrap()
            .unwrap();
        let again = rebuild(&mut conn, &defaults(), id).unwrap();
        assert_ne!(again, id);
        assert_eq!(Build::get(&conn, again).unwrap().specification_id, Build::get(&conn, id).unwrap().specification_id);

        let solve_id = solve_specification(&mut conn, &defaults(), submission("test", &["zlib"])).unwrap();
        assert!(Task::find_by_id(&conn, &solve_task_id(solve_id)).unwrap().is_some());
    }
}
