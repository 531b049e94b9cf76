// src/settings/mod.rs

//! Three-scope settings resolution
//!
//! Effective settings for `(namespace, environment)` are computed by
//! layering, in order: deployment defaults (the `[settings]` table of the
//! config file), the global `setting` prefix, `setting/{ns}` and
//! `setting/{ns}/{env}`. Global-only keys are ignored in the two narrower
//! scopes. Lists and maps replace rather than merge.
//!
//! Values are validated by round-tripping through the typed [`Settings`]
//! struct, so a stored override always deserializes.

use crate::build::key::SUPPORTED_VERSIONS;
use crate::db::models::{ArtifactType, KeyValueSetting};
use crate::error::{Error, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Keys that may only be written at global scope
pub const GLOBAL_ONLY: &[&str] = &[
    "default_namespace",
    "filesystem_namespace",
    "default_uid",
    "default_gid",
    "default_permissions",
    "storage_threshold",
    "conda_command",
    "conda_platforms",
    "conda_max_solve_time",
    "conda_indexed_channels",
    "build_artifacts_kept_on_deletion",
    "build_key_version",
    "win_extended_length_prefix",
];

const PREFIX: &str = "setting";

/// Effective configuration for builds and validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub default_namespace: String,
    /// Namespace used for environments discovered by `watch-paths`
    pub filesystem_namespace: String,
    pub default_uid: Option<u32>,
    pub default_gid: Option<u32>,
    /// Octal mode string such as `"775"`
    pub default_permissions: Option<String>,
    /// Minimum free bytes required before accepting a new build
    pub storage_threshold: u64,
    pub conda_command: String,
    pub conda_platforms: Vec<String>,
    /// Seconds
    pub conda_max_solve_time: u64,
    pub conda_indexed_channels: Vec<String>,
    pub build_artifacts_kept_on_deletion: Vec<ArtifactType>,
    pub build_key_version: u8,
    pub win_extended_length_prefix: bool,

    pub conda_solve_platforms: Vec<String>,
    pub conda_channel_alias: String,
    pub conda_default_channels: Vec<String>,
    pub conda_allowed_channels: Vec<String>,
    pub conda_default_packages: Vec<String>,
    pub conda_required_packages: Vec<String>,
    pub conda_included_packages: Vec<String>,
    pub pypi_default_packages: Vec<String>,
    pub pypi_required_packages: Vec<String>,
    pub pypi_included_packages: Vec<String>,
    pub build_artifacts: Vec<ArtifactType>,
    pub default_docker_base_image: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_namespace: "default".into(),
            filesystem_namespace: "filesystem".into(),
            default_uid: None,
            default_gid: None,
            default_permissions: None,
            storage_threshold: 5 * 1024 * 1024 * 1024,
            conda_command: "mamba".into(),
            conda_platforms: vec![current_platform().to_string(), "noarch".into()],
            conda_max_solve_time: 5 * 60,
            conda_indexed_channels: vec!["main".into(), "conda-forge".into()],
            build_artifacts_kept_on_deletion: vec![
                ArtifactType::Logs,
                ArtifactType::Lockfile,
                ArtifactType::Yaml,
            ],
            build_key_version: 2,
            win_extended_length_prefix: false,

            conda_solve_platforms: vec![current_platform().to_string()],
            conda_channel_alias: "https://conda.anaconda.org".into(),
            conda_default_channels: vec!["conda-forge".into()],
            conda_allowed_channels: Vec::new(),
            conda_default_packages: Vec::new(),
            conda_required_packages: Vec::new(),
            conda_included_packages: Vec::new(),
            pypi_default_packages: Vec::new(),
            pypi_required_packages: Vec::new(),
            pypi_included_packages: Vec::new(),
            build_artifacts: vec![
                ArtifactType::Lockfile,
                ArtifactType::Yaml,
                ArtifactType::CondaPack,
                ArtifactType::Installer,
            ],
            default_docker_base_image: "registry-1.docker.io/library/debian:sid-slim".into(),
        }
    }
}

impl Settings {
    /// Every recognized key
    pub fn keys() -> Vec<String> {
        match serde_json::to_value(Settings::default()) {
            Ok(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_global_only(key: &str) -> bool {
        GLOBAL_ONLY.contains(&key)
    }

    /// Parsed `default_permissions`
    pub fn permissions_mode(&self) -> Result<Option<u32>> {
        self.default_permissions
            .as_deref()
            .map(|mode| match u32::from_str_radix(mode, 8) {
                Ok(bits) if bits <= 0o7777 => Ok(bits),
                _ => Err(Error::Validation(format!("invalid default_permissions {mode}"))),
            })
            .transpose()
    }

    /// Checks the values serde alone cannot
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_VERSIONS.contains(&self.build_key_version) {
            return Err(Error::Validation(format!(
                "build_key_version must be one of {:?}, got {}",
                SUPPORTED_VERSIONS, self.build_key_version
            )));
        }
        self.permissions_mode()?;
        Ok(())
    }

    fn to_map(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(Error::Serialization("settings did not serialize to a map".into())),
        }
    }
}

/// Conda subdir name of the host platform
pub fn current_platform() -> &'static str {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("linux", "aarch64") => "linux-aarch64",
        ("linux", "powerpc64") => "linux-ppc64le",
        ("linux", _) => "linux-64",
        ("macos", "aarch64") => "osx-arm64",
        ("macos", _) => "osx-64",
        ("windows", _) => "win-64",
        _ => "linux-64",
    }
}

/// Key-value prefix for a scope
pub fn scope_prefix(namespace: Option<&str>, environment: Option<&str>) -> String {
    match (namespace, environment) {
        (Some(ns), Some(env)) => format!("{PREFIX}/{ns}/{env}"),
        (Some(ns), None) => format!("{PREFIX}/{ns}"),
        _ => PREFIX.to_string(),
    }
}

/// Resolve effective settings for an optional namespace and environment
pub fn get_settings(
    conn: &Connection,
    defaults: &Settings,
    namespace: Option<&str>,
    environment: Option<&str>,
) -> Result<Settings> {
    let mut merged = defaults.to_map()?;

    overlay(&mut merged, KeyValueSetting::find_by_prefix(conn, PREFIX)?, false);
    if let Some(ns) = namespace {
        let rows = KeyValueSetting::find_by_prefix(conn, &scope_prefix(Some(ns), None))?;
        overlay(&mut merged, rows, true);
        if let Some(env) = environment {
            let rows = KeyValueSetting::find_by_prefix(conn, &scope_prefix(Some(ns), Some(env)))?;
            overlay(&mut merged, rows, true);
        }
    }

    serde_json::from_value(Value::Object(merged))
        .map_err(|e| Error::Validation(format!("stored settings are invalid: {e}")))
}

fn overlay(merged: &mut Map<String, Value>, rows: Vec<KeyValueSetting>, scoped: bool) {
    for row in rows {
        if scoped && Settings::is_global_only(&row.key) {
            debug!("Ignoring global-only setting {} under {}", row.key, row.prefix);
            continue;
        }
        merged.insert(row.key, row.value);
    }
}

/// Validate and persist overrides at a scope
///
/// Either every key is written or none is.
pub fn set_settings(
    conn: &mut Connection,
    defaults: &Settings,
    namespace: Option<&str>,
    environment: Option<&str>,
    data: &Map<String, Value>,
) -> Result<()> {
    if environment.is_some() && namespace.is_none() {
        return Err(Error::Validation(
            "an environment setting requires a namespace".into(),
        ));
    }
    let scoped = namespace.is_some();
    let known = Settings::keys();
    let base = defaults.to_map()?;

    for (key, value) in data {
        if !known.iter().any(|k| k == key) {
            return Err(Error::Validation(format!("invalid setting name {key}")));
        }
        if scoped && Settings::is_global_only(key) {
            return Err(Error::Validation(format!(
                "setting {key} is a global setting and cannot be set within a namespace or environment"
            )));
        }
        let mut candidate = base.clone();
        candidate.insert(key.clone(), value.clone());
        let candidate = serde_json::from_value::<Settings>(Value::Object(candidate))
            .map_err(|e| Error::Validation(format!("invalid value for setting {key}: {e}")))?;
        candidate.validate()?;
    }

    let prefix = scope_prefix(namespace, environment);
    crate::db::transaction(conn, |tx| {
        for (key, value) in data {
            KeyValueSetting::upsert(tx, &prefix, key, value)?;
        }
        Ok(())
    })
}
